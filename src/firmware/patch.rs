//! Character-level text patches in the diff-match-patch textual format.
//!
//! The device firmware applies patches with a diff-match-patch port, so hunk
//! layout, context padding and percent-encoding follow that format exactly:
//!
//! ```text
//! @@ -1,8 +1,9 @@
//!  print(
//! -1
//! +42
//!  )%0A
//! ```
//!
//! Positions and lengths count Unicode scalar values, not bytes.

use super::PatchError;
use similar::{capture_diff_slices_deadline, Algorithm, DiffTag};
use std::fmt::Write as _;
use std::time::{Duration, Instant};

/// Context characters added on each side of a hunk.
const PATCH_MARGIN: usize = 4;
/// Upper bound on a hunk's source pattern while widening context.
const MATCH_MAX_BITS: usize = 32;
/// Budget for a single diff before settling for a non-minimal edit script.
const DIFF_TIMEOUT: Duration = Duration::from_secs(2);

/// Characters left unescaped besides ASCII alphanumerics.
const UNRESERVED: &str = "-_.~!*'();/?:@&=+$,# ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Equal,
    Delete,
    Insert,
}

impl Op {
    const fn sign(self) -> char {
        match self {
            Self::Equal => ' ',
            Self::Delete => '-',
            Self::Insert => '+',
        }
    }
}

/// One contiguous edit with its surrounding context.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Hunk {
    pub start1: usize,
    pub start2: usize,
    pub length1: usize,
    pub length2: usize,
    pub segments: Vec<(Op, Vec<char>)>,
}

impl Hunk {
    /// Text this hunk expects to find (context and deletions).
    fn source(&self) -> Vec<char> {
        self.collect(Op::Insert)
    }

    /// Text this hunk leaves behind (context and insertions).
    fn target(&self) -> Vec<char> {
        self.collect(Op::Delete)
    }

    fn collect(&self, skip: Op) -> Vec<char> {
        self.segments
            .iter()
            .filter(|(op, _)| *op != skip)
            .flat_map(|(_, text)| text.iter().copied())
            .collect()
    }

    fn header(&self) -> String {
        format!(
            "@@ -{} +{} @@\n",
            coords(self.start1, self.length1),
            coords(self.start2, self.length2)
        )
    }
}

fn coords(start: usize, length: usize) -> String {
    match length {
        0 => format!("{start},0"),
        1 => format!("{}", start + 1),
        _ => format!("{},{length}", start + 1),
    }
}

/// A list of hunks turning one text into another.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TextPatch {
    pub hunks: Vec<Hunk>,
}

impl TextPatch {
    /// Build the patch turning `old` into `new`.
    pub fn make(old: &str, new: &str) -> Self {
        let old: Vec<char> = old.chars().collect();
        let new: Vec<char> = new.chars().collect();
        let diffs = diff_chars(&old, &new);
        Self {
            hunks: hunks_from_diffs(&old, &diffs),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.hunks.is_empty()
    }

    /// Serialize to patch text.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        for hunk in &self.hunks {
            out.push_str(&hunk.header());
            for (op, text) in &hunk.segments {
                out.push(op.sign());
                out.push_str(&encode_segment(text));
                out.push('\n');
            }
        }
        out
    }

    /// Parse patch text produced by [`TextPatch::to_text`] or any
    /// diff-match-patch implementation.
    pub fn from_text(text: &str) -> Result<Self, PatchError> {
        let mut hunks = Vec::new();
        let mut current: Option<Hunk> = None;

        for (number, line) in text.split('\n').enumerate() {
            if line.is_empty() {
                continue;
            }
            if line.starts_with("@@") {
                if let Some(hunk) = current.take() {
                    hunks.push(hunk);
                }
                current = Some(parse_header(line).ok_or_else(|| {
                    PatchError::Malformed(format!("bad hunk header on line {}: {line}", number + 1))
                })?);
                continue;
            }
            let hunk = current.as_mut().ok_or_else(|| {
                PatchError::Malformed(format!("line {} precedes any hunk header", number + 1))
            })?;
            let mut chars = line.chars();
            let op = match chars.next() {
                Some(' ') => Op::Equal,
                Some('-') => Op::Delete,
                Some('+') => Op::Insert,
                _ => {
                    return Err(PatchError::Malformed(format!(
                        "invalid patch mode on line {}: {line}",
                        number + 1
                    )))
                }
            };
            let decoded = decode_segment(chars.as_str()).ok_or_else(|| {
                PatchError::Malformed(format!("bad percent-encoding on line {}", number + 1))
            })?;
            hunk.segments.push((op, decoded.chars().collect()));
        }
        if let Some(hunk) = current {
            hunks.push(hunk);
        }
        Ok(Self { hunks })
    }

    /// Apply to `old`. Each hunk must match exactly, at its expected
    /// position or at the nearest exact occurrence of its source text.
    pub fn apply(&self, old: &str) -> Result<String, PatchError> {
        let mut text: Vec<char> = old.chars().collect();
        let mut delta: isize = 0;

        for (index, hunk) in self.hunks.iter().enumerate() {
            let source = hunk.source();
            let target = hunk.target();
            let expected = usize::try_from(hunk.start2 as isize + delta).unwrap_or(0);
            let location = locate(&text, &source, expected)
                .ok_or(PatchError::HunkMismatch { hunk: index })?;
            delta = location as isize - hunk.start2 as isize;
            text.splice(location..location + source.len(), target);
        }
        Ok(text.into_iter().collect())
    }
}

fn parse_header(line: &str) -> Option<Hunk> {
    let inner = line.strip_prefix("@@ -")?.strip_suffix(" @@")?;
    let (left, right) = inner.split_once(" +")?;
    let (start1, length1) = parse_range(left)?;
    let (start2, length2) = parse_range(right)?;
    Some(Hunk {
        start1,
        start2,
        length1,
        length2,
        segments: Vec::new(),
    })
}

fn parse_range(range: &str) -> Option<(usize, usize)> {
    match range.split_once(',') {
        None => Some((range.parse::<usize>().ok()?.checked_sub(1)?, 1)),
        Some((start, "0")) => Some((start.parse().ok()?, 0)),
        Some((start, len)) => Some((start.parse::<usize>().ok()?.checked_sub(1)?, len.parse().ok()?)),
    }
}

fn locate(text: &[char], pattern: &[char], expected: usize) -> Option<usize> {
    if expected + pattern.len() <= text.len() && text[expected..expected + pattern.len()] == *pattern {
        return Some(expected);
    }
    if pattern.len() > text.len() {
        return None;
    }
    (0..=text.len() - pattern.len())
        .filter(|&i| text[i..i + pattern.len()] == *pattern)
        .min_by_key(|&i| i.abs_diff(expected))
}

// ============================================================================
// Diff → hunks
// ============================================================================

fn diff_chars(old: &[char], new: &[char]) -> Vec<(Op, Vec<char>)> {
    let deadline = Instant::now() + DIFF_TIMEOUT;
    let mut diffs: Vec<(Op, Vec<char>)> = Vec::new();
    let mut push = |op: Op, chars: &[char]| {
        if chars.is_empty() {
            return;
        }
        match diffs.last_mut() {
            Some((last, text)) if *last == op => text.extend_from_slice(chars),
            _ => diffs.push((op, chars.to_vec())),
        }
    };

    for diff_op in capture_diff_slices_deadline(Algorithm::Myers, old, new, Some(deadline)) {
        let (tag, old_range, new_range) = diff_op.as_tag_tuple();
        match tag {
            DiffTag::Equal => push(Op::Equal, &old[old_range]),
            DiffTag::Delete => push(Op::Delete, &old[old_range]),
            DiffTag::Insert => push(Op::Insert, &new[new_range]),
            DiffTag::Replace => {
                push(Op::Delete, &old[old_range]);
                push(Op::Insert, &new[new_range]);
            }
        }
    }
    diffs
}

fn hunks_from_diffs(old: &[char], diffs: &[(Op, Vec<char>)]) -> Vec<Hunk> {
    let mut hunks = Vec::new();
    if diffs.iter().all(|(op, _)| *op == Op::Equal) {
        return hunks;
    }

    let mut hunk = Hunk::default();
    let mut count1 = 0usize;
    let mut count2 = 0usize;
    // Text with every finished hunk applied; context is taken from it.
    let mut prepatch: Vec<char> = old.to_vec();
    let mut postpatch: Vec<char> = old.to_vec();

    for (index, (op, text)) in diffs.iter().enumerate() {
        let len = text.len();
        if hunk.segments.is_empty() && *op != Op::Equal {
            hunk.start1 = count1;
            hunk.start2 = count2;
        }

        match op {
            Op::Insert => {
                hunk.segments.push((Op::Insert, text.clone()));
                hunk.length2 += len;
                postpatch.splice(count2..count2, text.iter().copied());
            }
            Op::Delete => {
                hunk.length1 += len;
                hunk.segments.push((Op::Delete, text.clone()));
                postpatch.drain(count2..count2 + len);
            }
            Op::Equal => {
                if len <= 2 * PATCH_MARGIN && !hunk.segments.is_empty() && index + 1 != diffs.len() {
                    hunk.segments.push((Op::Equal, text.clone()));
                    hunk.length1 += len;
                    hunk.length2 += len;
                }
                if len >= 2 * PATCH_MARGIN && !hunk.segments.is_empty() {
                    add_context(&mut hunk, &prepatch);
                    hunks.push(std::mem::take(&mut hunk));
                    prepatch.clone_from(&postpatch);
                    count1 = count2;
                }
            }
        }

        if *op != Op::Insert {
            count1 += len;
        }
        if *op != Op::Delete {
            count2 += len;
        }
    }

    if !hunk.segments.is_empty() {
        add_context(&mut hunk, &prepatch);
        hunks.push(hunk);
    }
    hunks
}

/// Widen the hunk with context until its source pattern is unique in `text`.
fn add_context(hunk: &mut Hunk, text: &[char]) {
    if text.is_empty() {
        return;
    }
    let mut pattern = clamp(text, hunk.start2, hunk.start2 + hunk.length1);
    let mut padding = 0usize;
    while find(text, pattern) != rfind(text, pattern)
        && pattern.len() < MATCH_MAX_BITS - 2 * PATCH_MARGIN
    {
        padding += PATCH_MARGIN;
        pattern = clamp(
            text,
            hunk.start2.saturating_sub(padding),
            hunk.start2 + hunk.length1 + padding,
        );
    }
    padding += PATCH_MARGIN;

    let prefix = clamp(text, hunk.start2.saturating_sub(padding), hunk.start2).to_vec();
    let suffix = clamp(
        text,
        hunk.start2 + hunk.length1,
        hunk.start2 + hunk.length1 + padding,
    )
    .to_vec();

    hunk.start1 -= prefix.len();
    hunk.start2 -= prefix.len();
    hunk.length1 += prefix.len() + suffix.len();
    hunk.length2 += prefix.len() + suffix.len();
    if !prefix.is_empty() {
        hunk.segments.insert(0, (Op::Equal, prefix));
    }
    if !suffix.is_empty() {
        hunk.segments.push((Op::Equal, suffix));
    }
}

fn clamp(text: &[char], start: usize, end: usize) -> &[char] {
    let end = end.min(text.len());
    let start = start.min(end);
    &text[start..end]
}

fn find(text: &[char], pattern: &[char]) -> Option<usize> {
    if pattern.len() > text.len() {
        return None;
    }
    (0..=text.len() - pattern.len()).find(|&i| text[i..i + pattern.len()] == *pattern)
}

fn rfind(text: &[char], pattern: &[char]) -> Option<usize> {
    if pattern.len() > text.len() {
        return None;
    }
    (0..=text.len() - pattern.len())
        .rev()
        .find(|&i| text[i..i + pattern.len()] == *pattern)
}

// ============================================================================
// Percent encoding
// ============================================================================

fn encode_segment(text: &[char]) -> String {
    let mut out = String::with_capacity(text.len());
    let mut buf = [0u8; 4];
    for &c in text {
        if c.is_ascii_alphanumeric() || UNRESERVED.contains(c) {
            out.push(c);
        } else {
            for byte in c.encode_utf8(&mut buf).bytes() {
                let _ = write!(out, "%{byte:02X}");
            }
        }
    }
    out
}

fn decode_segment(text: &str) -> Option<String> {
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = text.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}
