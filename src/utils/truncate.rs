//! Text Budgeting
//!
//! One unit of work approximates one model token, i.e. four bytes of
//! UTF-8. The budget controller sizes allocations with it and agents trim
//! their prompts to it.

pub const BYTES_PER_UNIT: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TruncationPolicy {
    Bytes(usize),
    Tokens(usize),
}

impl TruncationPolicy {
    fn max_bytes(self) -> usize {
        match self {
            TruncationPolicy::Bytes(b) => b,
            TruncationPolicy::Tokens(t) => t.saturating_mul(BYTES_PER_UNIT),
        }
    }
}

pub fn approx_token_count(text: &str) -> usize {
    text.len().div_ceil(BYTES_PER_UNIT)
}

/// Keep the head and tail of `content` within budget and mark the elided
/// middle. Cuts never split a UTF-8 sequence.
pub fn truncate_text(content: &str, policy: TruncationPolicy) -> String {
    let max = policy.max_bytes();
    if content.len() <= max {
        return content.to_string();
    }
    if max == 0 {
        return format!("[{} bytes elided]", content.len());
    }

    let half = max / 2;
    let head_end = floor_char_boundary(content, half);
    let tail_start = ceil_char_boundary(content, content.len() - half).max(head_end);
    let elided = tail_start - head_end;

    format!("{} ... [{} bytes elided] ... {}", &content[..head_end], elided, &content[tail_start..])
}

/// Single-line preview for log fields
pub fn preview(text: &str, max_bytes: usize) -> String {
    let flat = text.replace('\n', " ");
    if flat.len() <= max_bytes {
        return flat;
    }
    let end = floor_char_boundary(&flat, max_bytes.saturating_sub(3));
    format!("{}...", &flat[..end])
}

fn floor_char_boundary(s: &str, mut i: usize) -> usize {
    i = i.min(s.len());
    while !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn ceil_char_boundary(s: &str, mut i: usize) -> usize {
    while i < s.len() && !s.is_char_boundary(i) {
        i += 1;
    }
    i
}
