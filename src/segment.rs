//! Q/A-aware document segmenter.
//!
//! Splits raw document text into retrievable chunk strings. A line-oriented
//! first pass detects blocks: explicit `Q:`/`A:` pairs, implicit questions
//! (a line ending in `?` followed by answer lines), and plain paragraphs.
//! A second pass greedily packs blocks into chunks bounded by
//! `max_chunk_size` characters, splitting oversized blocks at sentence
//! boundaries and, as a last resort, at fixed character offsets.
//!
//! Q/A blocks are emitted in the canonical form `Q: <question> A: <answer>`
//! so the retrieval layer can recognize them for direct answering.

/// A detected block before packing.
#[derive(Debug, Clone, PartialEq)]
enum Block {
    QaPair { question: String, answer: String },
    Paragraph(String),
}

/// Split `raw_text` into ordered chunk strings.
///
/// Chunks never exceed `max_chunk_size` characters. When `overlap_size > 0`,
/// each chunk after the first is prefixed with the trailing
/// `min(overlap_size, max_chunk_size / 2)` characters of the previous chunk;
/// the prefix counts against the chunk budget. Empty or whitespace-only
/// input yields no chunks.
pub fn segment(raw_text: &str, max_chunk_size: usize, overlap_size: usize) -> Vec<String> {
    let normalized = raw_text.replace("\r\n", "\n").replace('\r', "\n");
    let blocks = detect_blocks(&normalized);

    let rendered: Vec<String> = blocks
        .into_iter()
        .map(render_block)
        .filter(|b| !b.is_empty())
        .collect();

    pack_blocks(&rendered, max_chunk_size, overlap_size)
}

// ============ Block detection ============

/// Strip a question marker (`Q:` / `Question:`) from a line, if present.
fn strip_q_marker(line: &str) -> Option<&str> {
    let t = line.trim_start();
    for marker in ["Q:", "q:", "Question:", "question:", "QUESTION:"] {
        if let Some(rest) = t.strip_prefix(marker) {
            return Some(rest.trim_start());
        }
    }
    None
}

/// Strip an answer marker (`A:` / `Answer:`) from a line, if present.
fn strip_a_marker(line: &str) -> &str {
    let t = line.trim_start();
    for marker in ["A:", "a:", "Answer:", "answer:", "ANSWER:"] {
        if let Some(rest) = t.strip_prefix(marker) {
            return rest.trim_start();
        }
    }
    t
}

fn is_blank(line: &str) -> bool {
    line.trim().is_empty()
}

fn detect_blocks(text: &str) -> Vec<Block> {
    let lines: Vec<&str> = text.lines().collect();
    let mut blocks = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        let line = lines[i];

        if is_blank(line) {
            i += 1;
            continue;
        }

        // Explicit Q: marker starts a Q/A block.
        if let Some(question) = strip_q_marker(line) {
            let mut answer_lines = Vec::new();
            i += 1;
            while i < lines.len() && !is_blank(lines[i]) && strip_q_marker(lines[i]).is_none() {
                answer_lines.push(strip_a_marker(lines[i]));
                i += 1;
            }
            blocks.push(Block::QaPair {
                question: question.to_string(),
                answer: answer_lines.join(" "),
            });
            continue;
        }

        // A bare line ending in `?` is an implicit question when at least one
        // following non-blank, non-question line exists before the boundary.
        if line.trim_end().ends_with('?') {
            let mut j = i + 1;
            let mut answer_lines = Vec::new();
            let mut has_statement = false;
            while j < lines.len() && !is_blank(lines[j]) && strip_q_marker(lines[j]).is_none() {
                if !lines[j].trim_end().ends_with('?') {
                    has_statement = true;
                }
                answer_lines.push(strip_a_marker(lines[j]));
                j += 1;
            }
            if has_statement {
                blocks.push(Block::QaPair {
                    question: line.trim().to_string(),
                    answer: answer_lines.join(" "),
                });
                i = j;
                continue;
            }
        }

        // Plain paragraph: accumulate until blank line or Q-marker boundary.
        let mut para_lines = vec![line];
        i += 1;
        while i < lines.len() && !is_blank(lines[i]) && strip_q_marker(lines[i]).is_none() {
            para_lines.push(lines[i]);
            i += 1;
        }
        blocks.push(Block::Paragraph(para_lines.join(" ")));
    }

    blocks
}

/// Collapse whitespace runs to single spaces and trim.
fn normalize_ws(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn render_block(block: Block) -> String {
    match block {
        Block::QaPair { question, answer } => {
            let q = normalize_ws(&question);
            let a = normalize_ws(&answer);
            if q.is_empty() && a.is_empty() {
                String::new()
            } else if a.is_empty() {
                format!("Q: {}", q)
            } else {
                format!("Q: {} A: {}", q, a)
            }
        }
        Block::Paragraph(text) => normalize_ws(&text),
    }
}

// ============ Packing ============

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Trailing `n` characters of `s` (whole string if shorter).
fn tail_chars(s: &str, n: usize) -> String {
    let chars: Vec<char> = s.chars().collect();
    let start = chars.len().saturating_sub(n);
    chars[start..].iter().collect()
}

/// Greedy packer that tracks the character budget of the current buffer,
/// including any overlap prefix seeded from the previously emitted chunk.
struct Packer {
    max: usize,
    overlap: usize,
    chunks: Vec<String>,
    buf: String,
    buf_len: usize,
    /// Characters added beyond the overlap prefix. A buffer holding only a
    /// prefix is never emitted as a chunk of its own.
    content_len: usize,
}

impl Packer {
    fn new(max_chunk_size: usize, overlap_size: usize) -> Self {
        let max = max_chunk_size.max(1);
        Self {
            max,
            overlap: overlap_size.min(max / 2),
            chunks: Vec::new(),
            buf: String::new(),
            buf_len: 0,
            content_len: 0,
        }
    }

    fn room(&self) -> usize {
        self.max - self.buf_len
    }

    /// Emits the current buffer (if it holds content) and seeds the next one
    /// with the trailing overlap characters of the emitted chunk.
    fn flush(&mut self) {
        if self.content_len > 0 {
            let text = self.buf.trim().to_string();
            if !text.is_empty() {
                self.chunks.push(text);
            }
        }
        self.buf.clear();
        self.buf_len = 0;
        self.content_len = 0;

        if self.overlap > 0 {
            if let Some(prev) = self.chunks.last() {
                let prefix = tail_chars(prev, self.overlap);
                let prefix_len = char_len(&prefix) + 1;
                // A prefix that would fill the whole budget is dropped.
                if prefix_len < self.max {
                    self.buf_len = prefix_len;
                    self.buf.push_str(&prefix);
                    self.buf.push(' ');
                }
            }
        }
    }

    fn push_block(&mut self, block: &str) {
        let b_len = char_len(block);
        let sep = if self.content_len == 0 { 0 } else { 2 };
        if sep + b_len <= self.room() {
            if self.content_len > 0 {
                self.buf.push_str("\n\n");
            }
            self.buf.push_str(block);
            self.buf_len += sep + b_len;
            self.content_len += b_len;
            return;
        }

        if self.content_len > 0 {
            self.flush();
        }
        if b_len <= self.room() {
            self.buf.push_str(block);
            self.buf_len += b_len;
            self.content_len += b_len;
        } else {
            // The overlap prefix leaves too little room for the whole block.
            for sentence in split_sentences(block) {
                self.push_sentence(&sentence);
            }
        }
    }

    fn push_sentence(&mut self, sentence: &str) {
        let s_len = char_len(sentence);
        let sep = if self.content_len == 0 { 0 } else { 1 };

        if sep + s_len <= self.room() {
            if self.content_len > 0 {
                self.buf.push(' ');
            }
            self.buf.push_str(sentence);
            self.buf_len += sep + s_len;
            self.content_len += s_len;
            return;
        }

        if self.content_len > 0 {
            self.flush();
        }

        if s_len <= self.room() {
            self.buf.push_str(sentence);
            self.buf_len += s_len;
            self.content_len += s_len;
            return;
        }

        self.hard_split(sentence);
    }

    /// Last resort for an atom with no internal break: fill each chunk's
    /// remaining budget at fixed character offsets.
    fn hard_split(&mut self, atom: &str) {
        let chars: Vec<char> = atom.chars().collect();
        let mut pos = 0;
        while pos < chars.len() {
            if self.room() == 0 {
                self.flush();
                if self.room() == 0 {
                    // Overlap prefix consumed the whole budget; drop it.
                    self.buf.clear();
                    self.buf_len = 0;
                }
            }
            let take = self.room().min(chars.len() - pos);
            let piece: String = chars[pos..pos + take].iter().collect();
            self.buf.push_str(&piece);
            self.buf_len += take;
            self.content_len += take;
            pos += take;
            if pos < chars.len() {
                self.flush();
            }
        }
    }

    fn finish(mut self) -> Vec<String> {
        self.flush();
        self.chunks
    }
}

fn pack_blocks(blocks: &[String], max_chunk_size: usize, overlap_size: usize) -> Vec<String> {
    let mut packer = Packer::new(max_chunk_size, overlap_size);
    for block in blocks {
        // A block exceeding the limit alone is split at sentence boundaries.
        if char_len(block) > packer.max {
            if packer.content_len > 0 {
                packer.flush();
            }
            for sentence in split_sentences(block) {
                packer.push_sentence(&sentence);
            }
        } else {
            packer.push_block(block);
        }
    }
    packer.finish()
}

/// Split a block at sentence boundaries: `.`/`!`/`?` followed by whitespace
/// and an uppercase letter, digit, or opening quote.
fn split_sentences(text: &str) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let mut sentences = Vec::new();
    let mut start = 0;

    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if matches!(c, '.' | '!' | '?') && i + 1 < chars.len() && chars[i + 1].is_whitespace() {
            // Find the first non-whitespace character after the boundary.
            let mut j = i + 1;
            while j < chars.len() && chars[j].is_whitespace() {
                j += 1;
            }
            let next_starts_sentence = j < chars.len()
                && (chars[j].is_uppercase()
                    || chars[j].is_ascii_digit()
                    || matches!(chars[j], '"' | '\'' | '(' | '\u{201c}' | '\u{2018}'));
            if next_starts_sentence {
                let sentence: String = chars[start..=i].iter().collect();
                let trimmed = sentence.trim().to_string();
                if !trimmed.is_empty() {
                    sentences.push(trimmed);
                }
                start = j;
                i = j;
                continue;
            }
        }
        i += 1;
    }

    if start < chars.len() {
        let rest: String = chars[start..].iter().collect();
        let trimmed = rest.trim().to_string();
        if !trimmed.is_empty() {
            sentences.push(trimmed);
        }
    }

    sentences
}
