//! The join pass: turning a flat stream of render pieces into output segments.

use crate::id::ObjectId;
use serde::{Deserialize, Serialize};

/// One segment of rendered output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "tag")]
pub enum Segment {
    Text { value: String },
    Link { to: ObjectId, text: String },
    LineBreak,
    /// A bookmark that would have included itself.
    CircularReference { to: ObjectId },
}

impl Segment {
    pub fn text(value: impl Into<String>) -> Self {
        Segment::Text { value: value.into() }
    }
}

/// A render item after conditions and bookmarks have been resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Piece {
    Text {
        value: String,
        space_before: bool,
        space_after: bool,
    },
    Link {
        to: ObjectId,
        text: String,
        space_before: bool,
        space_after: bool,
    },
    LineBreak,
    Circular(ObjectId),
}

/// Merge adjacent text into runs.
///
/// A join gets exactly one space when either side asks for it, and is left
/// untouched otherwise. Links, line breaks and cycle markers stay separate
/// segments; spaces around them go into the neighbouring text.
pub(crate) fn join(pieces: Vec<Piece>) -> Vec<Segment> {
    let mut out: Vec<Segment> = Vec::new();
    let mut pending_space = false;
    let mut line_start = true;

    for piece in pieces {
        match piece {
            Piece::Text {
                value,
                space_before,
                space_after,
            } => {
                if value.is_empty() {
                    pending_space |= space_before || space_after;
                    continue;
                }
                let space = !line_start && (pending_space || space_before);
                match out.last_mut() {
                    Some(Segment::Text { value: run }) => append_text(run, &value, space),
                    _ => {
                        let mut run = String::new();
                        append_text(&mut run, &value, space);
                        out.push(Segment::Text { value: run });
                    }
                }
                pending_space = space_after;
                line_start = false;
            }
            Piece::Link {
                to,
                text,
                space_before,
                space_after,
            } => {
                if !line_start && (pending_space || space_before) {
                    push_space(&mut out);
                }
                out.push(Segment::Link { to, text });
                pending_space = space_after;
                line_start = false;
            }
            Piece::LineBreak => {
                if let Some(Segment::Text { value }) = out.last_mut() {
                    let kept = value.trim_end().len();
                    value.truncate(kept);
                }
                out.push(Segment::LineBreak);
                pending_space = false;
                line_start = true;
            }
            Piece::Circular(to) => {
                if pending_space {
                    push_space(&mut out);
                }
                out.push(Segment::CircularReference { to });
                pending_space = false;
                line_start = false;
            }
        }
    }

    out.retain(|segment| !matches!(segment, Segment::Text { value } if value.is_empty()));
    out
}

fn append_text(run: &mut String, next: &str, space: bool) {
    if space {
        let kept = run.trim_end().len();
        run.truncate(kept);
        run.push(' ');
        run.push_str(next.trim_start());
    } else {
        run.push_str(next);
    }
}

/// End the output with exactly one space before a link or marker.
fn push_space(out: &mut Vec<Segment>) {
    match out.last_mut() {
        Some(Segment::Text { value }) => {
            let kept = value.trim_end().len();
            value.truncate(kept);
            value.push(' ');
        }
        _ => out.push(Segment::text(" ")),
    }
}
