//! Separation of inline `<think>…</think>` reasoning from answer text.

use crate::context::StreamContext;
use crate::protocol::ProtocolChunk;

pub const THINK_OPEN: &str = "<think>";
pub const THINK_CLOSE: &str = "</think>";

/// Longest suffix that can be held back while waiting for the rest of a
/// delimiter.
pub const MAX_LOOKBACK: usize = THINK_CLOSE.len() - 1;

/// A run of text in one mode.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Segment {
    Text(String),
    Reasoning(String),
}

impl Segment {
    fn new(reasoning: bool, text: &str) -> Self {
        if reasoning {
            Self::Reasoning(text.to_string())
        } else {
            Self::Text(text.to_string())
        }
    }

    pub fn into_chunk(self, id: &str) -> ProtocolChunk {
        match self {
            Self::Text(text) => ProtocolChunk::text(id, text),
            Self::Reasoning(text) => ProtocolChunk::reasoning(id, text),
        }
    }
}

/// Splits `content` into text/reasoning segments, stripping delimiters.
///
/// A trailing partial delimiter (e.g. `</th`) is kept in the context and
/// re-examined with the next fragment, so a tag split across chunks still
/// toggles exactly once.
pub fn split_inline_reasoning(ctx: &mut StreamContext, content: &str) -> Vec<Segment> {
    let mut buffer = std::mem::take(&mut ctx.pending_tag);
    buffer.push_str(content);

    let mut segments = Vec::new();
    let mut rest = buffer.as_str();
    loop {
        match find_delimiter(rest) {
            Some((at, opening, len)) => {
                if at > 0 {
                    segments.push(Segment::new(ctx.thinking_in_content, &rest[..at]));
                }
                ctx.thinking_in_content = opening;
                rest = &rest[at + len..];
            }
            None => {
                let held = partial_delimiter_suffix(rest);
                let emit = &rest[..rest.len() - held];
                if !emit.is_empty() {
                    segments.push(Segment::new(ctx.thinking_in_content, emit));
                }
                ctx.pending_tag = rest[rest.len() - held..].to_string();
                break;
            }
        }
    }
    merge_adjacent(segments)
}

/// Releases any held-back text under the current mode. Called at finish.
pub fn flush_pending(ctx: &mut StreamContext) -> Option<Segment> {
    if ctx.pending_tag.is_empty() {
        return None;
    }
    let pending = std::mem::take(&mut ctx.pending_tag);
    Some(Segment::new(ctx.thinking_in_content, &pending))
}

/// Earliest delimiter in `text`: (byte offset, is opening tag, tag length).
fn find_delimiter(text: &str) -> Option<(usize, bool, usize)> {
    let open = text.find(THINK_OPEN).map(|at| (at, true, THINK_OPEN.len()));
    let close = text.find(THINK_CLOSE).map(|at| (at, false, THINK_CLOSE.len()));
    match (open, close) {
        (Some(o), Some(c)) => Some(if o.0 <= c.0 { o } else { c }),
        (o, c) => o.or(c),
    }
}

/// Length of the longest suffix of `text` that is a proper prefix of a
/// delimiter.
fn partial_delimiter_suffix(text: &str) -> usize {
    let max = MAX_LOOKBACK.min(text.len());
    (1..=max)
        .rev()
        .find(|&len| {
            text.is_char_boundary(text.len() - len) && {
                let suffix = &text[text.len() - len..];
                THINK_OPEN.starts_with(suffix) || THINK_CLOSE.starts_with(suffix)
            }
        })
        .unwrap_or(0)
}

fn merge_adjacent(segments: Vec<Segment>) -> Vec<Segment> {
    let mut merged: Vec<Segment> = Vec::with_capacity(segments.len());
    for segment in segments {
        match (merged.last_mut(), segment) {
            (Some(Segment::Text(prev)), Segment::Text(next)) => prev.push_str(&next),
            (Some(Segment::Reasoning(prev)), Segment::Reasoning(next)) => prev.push_str(&next),
            (_, segment) => merged.push(segment),
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn run(fragments: &[&str]) -> (String, String) {
        let mut ctx = StreamContext::new("s");
        let mut segments = Vec::new();
        for fragment in fragments {
            segments.extend(split_inline_reasoning(&mut ctx, fragment));
        }
        segments.extend(flush_pending(&mut ctx));
        collect(segments)
    }

    fn collect(segments: Vec<Segment>) -> (String, String) {
        let mut reasoning = String::new();
        let mut text = String::new();
        for segment in segments {
            match segment {
                Segment::Reasoning(r) => reasoning.push_str(&r),
                Segment::Text(t) => text.push_str(&t),
            }
        }
        (reasoning, text)
    }

    #[test]
    fn whole_tags_in_one_fragment() {
        assert_eq!(
            run(&["<think>A</think>B"]),
            ("A".to_string(), "B".to_string())
        );
    }

    #[test]
    fn tag_split_inside_literal() {
        assert_eq!(
            run(&["<thi", "nk>plan", "</th", "ink>answer"]),
            ("plan".to_string(), "answer".to_string())
        );
    }

    #[test]
    fn partial_prefix_does_not_toggle() {
        let mut ctx = StreamContext::new("s");
        let segments = split_inline_reasoning(&mut ctx, "a <thi");
        assert_eq!(segments, vec![Segment::Text("a ".into())]);
        assert!(!ctx.thinking_in_content);
        assert_eq!(ctx.pending_tag, "<thi");

        let segments = split_inline_reasoning(&mut ctx, "s is fine");
        assert_eq!(segments, vec![Segment::Text("<this is fine".into())]);
        assert!(!ctx.thinking_in_content);
    }

    #[test]
    fn stray_close_tag_is_stripped() {
        assert_eq!(
            run(&["reasoning only", "</think>", "Hello"]),
            (String::new(), "reasoning onlyHello".to_string())
        );
    }

    #[test]
    fn trailing_lt_is_flushed_at_finish() {
        assert_eq!(run(&["1 <"]), (String::new(), "1 <".to_string()));
    }

    #[test]
    fn lookback_never_exceeds_bound() {
        let mut ctx = StreamContext::new("s");
        split_inline_reasoning(&mut ctx, "</think");
        assert!(ctx.pending_tag.len() <= MAX_LOOKBACK);
    }

    #[test]
    fn multibyte_text_near_boundary_is_kept() {
        assert_eq!(
            run(&["<think>思考</think>答", "案😊"]),
            ("思考".to_string(), "答案😊".to_string())
        );
    }

    proptest! {
        #[test]
        fn arbitrary_split_separates_reasoning_and_text(
            a in "[a-zA-Z0-9 .,!?<>/\n]{0,24}",
            b in "[a-zA-Z0-9 .,!?<>/\n]{0,24}",
            cuts in prop::collection::vec(any::<prop::sample::Index>(), 0..10),
        ) {
            prop_assume!(!a.contains("think>") && !b.contains("think>"));
            let full = format!("<think>{a}</think>{b}");
            let mut points: Vec<usize> = cuts.iter().map(|i| i.index(full.len() + 1)).collect();
            points.sort_unstable();
            points.dedup();

            let mut fragments = Vec::new();
            let mut start = 0;
            for point in points.into_iter().chain(std::iter::once(full.len())) {
                fragments.push(&full[start..point]);
                start = point;
            }

            let (reasoning, text) = run(&fragments);
            prop_assert_eq!(reasoning, a);
            prop_assert_eq!(text, b);
        }
    }
}
