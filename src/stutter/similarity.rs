//! 编辑距离相似度
//!
//! 按字符（而非字节）计算，保证 UTF-8 多字节内容的正确性。

/// 计算两个字符串的 Levenshtein 编辑距离
///
/// 使用两行滚动数组，空间复杂度 O(min(m, n))
pub fn levenshtein_distance(a: &str, b: &str) -> usize {
    let a_chars: Vec<char> = a.chars().collect();
    let b_chars: Vec<char> = b.chars().collect();

    // 让内层循环遍历较短的字符串
    let (outer, inner) = if a_chars.len() >= b_chars.len() {
        (&a_chars, &b_chars)
    } else {
        (&b_chars, &a_chars)
    };

    if inner.is_empty() {
        return outer.len();
    }

    let mut prev_row: Vec<usize> = (0..=inner.len()).collect();
    let mut curr_row = vec![0; inner.len() + 1];

    for (i, oc) in outer.iter().enumerate() {
        curr_row[0] = i + 1;
        for (j, ic) in inner.iter().enumerate() {
            let cost = usize::from(oc != ic);
            curr_row[j + 1] = (prev_row[j + 1] + 1)
                .min(curr_row[j] + 1)
                .min(prev_row[j] + cost);
        }
        std::mem::swap(&mut prev_row, &mut curr_row);
    }

    prev_row[inner.len()]
}

/// 归一化相似度，范围 [0.0, 1.0]，1.0 表示完全相同
pub fn similarity_ratio(a: &str, b: &str) -> f64 {
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - levenshtein_distance(a, b) as f64 / max_len as f64
}

/// 相似度是否达到阈值
///
/// 长度差本身就是编辑距离的下界，差距过大时直接返回，避免对长缓冲做完整 DP
pub fn is_similar(a: &str, b: &str, threshold: f64) -> bool {
    let a_len = a.chars().count();
    let b_len = b.chars().count();
    let max_len = a_len.max(b_len);
    if max_len == 0 {
        return true;
    }
    let upper_bound = 1.0 - a_len.abs_diff(b_len) as f64 / max_len as f64;
    if upper_bound < threshold {
        return false;
    }
    similarity_ratio(a, b) >= threshold
}
