//! Text segmentation ahead of speech synthesis.
//!
//! Rules, applied in order on every push:
//! - flush through terminal punctuation (`. ! ? ; :` by default), but
//!   never a fragment shorter than `min_chars`;
//! - flush the whole buffer once it reaches `max_chars`.
//!
//! The time-driven rules (trailing comma held, idle stream) live in
//! the pipeline's segmenter task; this type only answers whether the
//! buffer currently ends in a comma.

use chorus_domain::config::PipelineConfig;

pub struct Segmenter {
    flush_punct: Vec<char>,
    max_chars: usize,
    min_chars: usize,
    buf: String,
}

impl Segmenter {
    pub fn new(cfg: &PipelineConfig) -> Self {
        Self {
            flush_punct: cfg.flush_punct.chars().collect(),
            max_chars: cfg.max_chars.max(1),
            min_chars: cfg.min_chars,
            buf: String::new(),
        }
    }

    /// Feed a chunk of text; returns every segment that became ready.
    pub fn push(&mut self, text: &str) -> Vec<String> {
        self.buf.push_str(text);
        let mut out = Vec::new();

        loop {
            // Earliest punctuation boundary that leaves a segment of
            // at least min_chars.
            let mut boundary = None;
            for (i, c) in self.buf.char_indices() {
                if self.flush_punct.contains(&c) {
                    let end = i + c.len_utf8();
                    if end >= self.min_chars {
                        boundary = Some(end);
                        break;
                    }
                }
            }

            if let Some(end) = boundary {
                let segment: String = self.buf.drain(..end).collect();
                let segment = segment.trim().to_string();
                if !segment.is_empty() {
                    out.push(segment);
                }
                continue;
            }

            if self.buf.len() >= self.max_chars {
                let segment = std::mem::take(&mut self.buf).trim().to_string();
                if !segment.is_empty() {
                    out.push(segment);
                }
                continue;
            }

            break;
        }

        out
    }

    /// Forced flush: everything buffered, regardless of length.
    pub fn flush(&mut self) -> Option<String> {
        if self.buf.trim().is_empty() {
            self.buf.clear();
            return None;
        }
        let segment = std::mem::take(&mut self.buf).trim().to_string();
        Some(segment)
    }

    pub fn has_trailing_comma(&self) -> bool {
        self.buf.trim_end().ends_with(',')
    }

    pub fn is_empty(&self) -> bool {
        self.buf.trim().is_empty()
    }
}
