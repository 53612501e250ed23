/// Splits a chunked byte stream into newline terminated lines.
///
/// Chunk boundaries may fall anywhere, including inside a multi-byte UTF-8 sequence, so the
/// partial tail is kept as bytes until its newline arrives.
#[derive(Debug, Default)]
pub struct LineSplitter {
    partial: Vec<u8>,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a chunk, returning every line it completes. Blank lines are skipped.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        let mut lines = Vec::new();
        let mut rest = chunk;

        while let Some(pos) = rest.iter().position(|b| *b == b'\n') {
            let (head, tail) = rest.split_at(pos);
            rest = &tail[1..];

            let line = if self.partial.is_empty() {
                head.to_vec()
            } else {
                let mut line = std::mem::take(&mut self.partial);
                line.extend_from_slice(head);
                line
            };

            if !is_blank(&line) {
                lines.push(line);
            }
        }

        self.partial.extend_from_slice(rest);

        lines
    }

    /// Returns the unterminated tail, if any, once the stream has ended.
    pub fn finish(&mut self) -> Option<Vec<u8>> {
        let line = std::mem::take(&mut self.partial);
        (!is_blank(&line)).then_some(line)
    }

    pub fn has_partial(&self) -> bool {
        !self.partial.is_empty()
    }
}

fn is_blank(line: &[u8]) -> bool {
    line.iter().all(|b| b.is_ascii_whitespace())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(lines: Vec<Vec<u8>>) -> Vec<String> {
        lines
            .into_iter()
            .map(|l| String::from_utf8(l).unwrap())
            .collect()
    }

    #[test]
    fn joins_lines_across_chunks() {
        let mut splitter = LineSplitter::new();

        assert!(splitter.push(b"{\"a\":").is_empty());
        assert_eq!(strings(splitter.push(b"1}\n{\"b\"")), vec!["{\"a\":1}"]);
        assert_eq!(strings(splitter.push(b":2}\n")), vec!["{\"b\":2}"]);
        assert!(!splitter.has_partial());
        assert_eq!(splitter.finish(), None);
    }

    #[test]
    fn several_lines_in_one_chunk() {
        let mut splitter = LineSplitter::new();
        assert_eq!(strings(splitter.push(b"1\n2\n\n3\n4")), vec!["1", "2", "3"]);
        assert_eq!(splitter.finish(), Some(b"4".to_vec()));
    }

    #[test]
    fn keeps_split_utf8_sequences_intact() {
        let text = "{\"name\":\"é\"}\n".as_bytes();
        let split = text.iter().position(|b| *b == 0xc3).unwrap() + 1;

        let mut splitter = LineSplitter::new();
        assert!(splitter.push(&text[..split]).is_empty());
        assert_eq!(strings(splitter.push(&text[split..])), vec!["{\"name\":\"é\"}"]);
    }
}
