use std::collections::VecDeque;

pub const DEFAULT_CHUNK_SIZE: usize = 1000;
pub const DEFAULT_CHUNK_OVERLAP: usize = 200;

/// Recursive character splitter. Tries each separator in turn and only descends to
/// the next one for pieces that are still too long; lengths are counted in chars.
#[derive(Debug, Clone)]
pub struct RecursiveSplitter {
    chunk_size: usize,
    chunk_overlap: usize,
    separators: Vec<String>,
}

impl Default for RecursiveSplitter {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE, DEFAULT_CHUNK_OVERLAP)
    }
}

impl RecursiveSplitter {
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            chunk_overlap: chunk_overlap.min(chunk_size.saturating_sub(1)),
            separators: ["\n\n", "\n", " ", ""].map(String::from).to_vec(),
        }
    }

    pub fn split(&self, text: &str) -> Vec<String> {
        self.split_with(text, &self.separators)
    }

    fn split_with(&self, text: &str, separators: &[String]) -> Vec<String> {
        let idx = separators
            .iter()
            .position(|s| s.is_empty() || text.contains(s.as_str()))
            .unwrap_or(separators.len().saturating_sub(1));
        let sep = separators.get(idx).map(String::as_str).unwrap_or("");
        let rest = separators.get(idx + 1..).unwrap_or(&[]);

        let mut out = Vec::new();
        let mut fitting: Vec<&str> = Vec::new();
        // An empty pattern splits at every char boundary.
        for piece in text.split(sep).filter(|p| !p.is_empty()) {
            if char_len(piece) < self.chunk_size {
                fitting.push(piece);
                continue;
            }
            if !fitting.is_empty() {
                out.extend(self.merge(&fitting, sep));
                fitting.clear();
            }
            if rest.is_empty() {
                out.push(piece.to_string());
            } else {
                out.extend(self.split_with(piece, rest));
            }
        }
        if !fitting.is_empty() {
            out.extend(self.merge(&fitting, sep));
        }
        out
    }

    /// Packs pieces into chunks up to `chunk_size`, carrying up to `chunk_overlap`
    /// chars of trailing pieces into the next chunk.
    fn merge(&self, pieces: &[&str], sep: &str) -> Vec<String> {
        let sep_len = char_len(sep);
        let mut docs = Vec::new();
        let mut current: VecDeque<&str> = VecDeque::new();
        let mut total = 0usize;

        for piece in pieces {
            let len = char_len(piece);
            let joiner = if current.is_empty() { 0 } else { sep_len };
            if total + len + joiner > self.chunk_size && !current.is_empty() {
                push_joined(&mut docs, &current, sep);
                while let Some(front) = current.front() {
                    if total <= self.chunk_overlap && total + len + sep_len <= self.chunk_size {
                        break;
                    }
                    let extra = if current.len() > 1 { sep_len } else { 0 };
                    total -= char_len(front) + extra;
                    current.pop_front();
                }
            }
            current.push_back(piece);
            total += len + if current.len() > 1 { sep_len } else { 0 };
        }
        push_joined(&mut docs, &current, sep);
        docs
    }
}

fn push_joined(docs: &mut Vec<String>, parts: &VecDeque<&str>, sep: &str) {
    let joined = parts.iter().copied().collect::<Vec<_>>().join(sep);
    let trimmed = joined.trim();
    if !trimmed.is_empty() {
        docs.push(trimmed.to_string());
    }
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}
