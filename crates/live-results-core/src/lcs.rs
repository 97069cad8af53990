//! Longest common subsequence over ordered sequences.
//!
//! Results pages change a few rows at a time, so both inputs usually share a
//! long prefix and suffix. Those are stripped first and the quadratic dynamic
//! program only runs over the differing middle.

/// Compute the longest common subsequence of `a` and `b`.
///
/// Ties in the dynamic program are resolved the same way every time: when
/// dropping the current element of `a` and dropping the current element of `b`
/// give equally long subsequences, the one that drops the element of `b` is
/// kept. Encoders on both ends of a link therefore derive the same alignment.
#[must_use]
pub fn longest_common_subsequence<T: PartialEq + Clone>(a: &[T], b: &[T]) -> Vec<T> {
    if a.is_empty() || b.is_empty() {
        return Vec::new();
    }

    let start = common_prefix_len(a, b);
    let (end_a, end_b) = common_suffix_bounds(a, b, start);

    if start >= end_a {
        return a.to_vec();
    }
    if start >= end_b {
        return b.to_vec();
    }

    let middle = middle_lcs(&a[start..end_a], &b[start..end_b]);

    let mut lcs = Vec::with_capacity(start + middle.len() + (a.len() - end_a));
    lcs.extend_from_slice(&a[..start]);
    lcs.extend(middle);
    lcs.extend_from_slice(&a[end_a..]);
    lcs
}

fn common_prefix_len<T: PartialEq>(a: &[T], b: &[T]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

/// Exclusive end bounds of `a` and `b` once the common suffix is removed. The
/// suffix never reaches back into the common prefix.
fn common_suffix_bounds<T: PartialEq>(a: &[T], b: &[T], start: usize) -> (usize, usize) {
    let (mut end_a, mut end_b) = (a.len(), b.len());
    while end_a > start && end_b > start && a[end_a - 1] == b[end_b - 1] {
        end_a -= 1;
        end_b -= 1;
    }
    (end_a, end_b)
}

/// Full O(n·m) dynamic program. Lengths are tabulated and the subsequence is
/// recovered by walking back through the same choices the forward pass made.
fn middle_lcs<T: PartialEq + Clone>(a: &[T], b: &[T]) -> Vec<T> {
    let cols = b.len() + 1;
    let mut lengths = vec![0usize; (a.len() + 1) * cols];

    for (i, el_a) in a.iter().enumerate() {
        for (j, el_b) in b.iter().enumerate() {
            let cell = (i + 1) * cols + (j + 1);
            lengths[cell] = if el_a == el_b {
                lengths[i * cols + j] + 1
            } else {
                let drop_a = lengths[i * cols + (j + 1)];
                let drop_b = lengths[(i + 1) * cols + j];
                drop_a.max(drop_b)
            };
        }
    }

    let mut out = Vec::with_capacity(lengths[a.len() * cols + b.len()]);
    let (mut i, mut j) = (a.len(), b.len());
    while i > 0 && j > 0 {
        if a[i - 1] == b[j - 1] {
            out.push(a[i - 1].clone());
            i -= 1;
            j -= 1;
        } else if lengths[(i - 1) * cols + j] > lengths[i * cols + (j - 1)] {
            i -= 1;
        } else {
            j -= 1;
        }
    }
    out.reverse();
    out
}
