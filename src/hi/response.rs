use crate::s11n::MAX_PAYLOAD;

use bytes::{BufMut, Bytes, BytesMut};

/// How `add_header` treats a name that is already present.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddMode {
    /// Keep the existing value.
    IfNotExists,
    /// Replace every existing value with the new one.
    Override,
    /// Append another line with the same name.
    Duplicate,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeaderAdded {
    New,
    Replaced,
    Duplicated,
    /// `IfNotExists` found the name already set; nothing changed.
    Kept,
}

/// Output header table. Insertion order is preserved and names compare
/// ASCII-case-insensitively. A `None` value renders as a bare `Name: ` line.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HeaderTable {
    entries: Vec<(String, Option<String>)>,
}

fn line_len(name: &str, value: &Option<String>) -> usize {
    name.len() + 2 + value.as_ref().map_or(0, String::len) + 2
}

impl HeaderTable {
    pub fn new() -> HeaderTable {
        HeaderTable::default()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|(n, _)| n.eq_ignore_ascii_case(name))
    }

    pub fn add(&mut self, mode: AddMode, name: String, value: Option<String>) -> HeaderAdded {
        let existing = match self.position(&name) {
            Some(idx) => idx,
            None => {
                self.entries.push((name, value));
                return HeaderAdded::New;
            },
        };
        match mode {
            AddMode::IfNotExists => HeaderAdded::Kept,
            AddMode::Override => {
                self.entries[existing].1 = value;
                let mut idx = 0;
                self.entries.retain(|(n, _)| {
                    let keep = idx <= existing || !n.eq_ignore_ascii_case(&name);
                    idx += 1;
                    keep
                });
                HeaderAdded::Replaced
            },
            AddMode::Duplicate => {
                self.entries.push((name, value));
                HeaderAdded::Duplicated
            },
        }
    }

    /// The first value under `name`; `Some(None)` for a bare header.
    pub fn get(&self, name: &str) -> Option<Option<&str>> {
        self.position(name).map(|idx| self.entries[idx].1.as_deref())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    /// Removes every line under `name` and returns how many there were.
    pub fn remove(&mut self, name: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        before - self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_deref()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serializes the table plus the terminating empty line into Stdout payloads,
    /// each at most `MAX_PAYLOAD` bytes. Lines that cannot fit in any single
    /// payload are dropped.
    pub fn render_blocks(&self) -> Vec<Bytes> {
        let mut blocks = Vec::new();
        let mut block = BytesMut::new();
        for (name, value) in &self.entries {
            let len = line_len(name, value);
            if len > MAX_PAYLOAD {
                warn!("dropping header {:?}: {} bytes exceed a record", name, len);
                continue;
            }
            if block.len() + len > MAX_PAYLOAD {
                blocks.push(block.split().freeze());
            }
            block.put_slice(name.as_bytes());
            block.put_slice(b": ");
            if let Some(value) = value {
                block.put_slice(value.as_bytes());
            }
            block.put_slice(b"\r\n");
        }
        if block.len() + 2 > MAX_PAYLOAD {
            blocks.push(block.split().freeze());
        }
        block.put_slice(b"\r\n");
        blocks.push(block.freeze());
        blocks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(entries: &[(&str, Option<&str>)]) -> HeaderTable {
        let mut headers = HeaderTable::new();
        for (name, value) in entries {
            headers.add(AddMode::Duplicate, name.to_string(), value.map(str::to_owned));
        }
        headers
    }

    #[test]
    fn add_modes() {
        let mut headers = HeaderTable::new();
        assert_eq!(HeaderAdded::New,
                   headers.add(AddMode::IfNotExists, "Content-Type".into(), Some("text/plain".into())));
        assert_eq!(HeaderAdded::Kept,
                   headers.add(AddMode::IfNotExists, "content-type".into(), Some("text/html".into())));
        assert_eq!(Some(Some("text/plain")), headers.get("CONTENT-TYPE"));

        assert_eq!(HeaderAdded::Duplicated,
                   headers.add(AddMode::Duplicate, "Content-Type".into(), Some("a".into())));
        assert_eq!(2, headers.len());

        assert_eq!(HeaderAdded::Replaced,
                   headers.add(AddMode::Override, "Content-type".into(), Some("b".into())));
        assert_eq!(vec![("Content-Type", Some("b"))], headers.iter().collect::<Vec<_>>());

        assert_eq!(HeaderAdded::New, headers.add(AddMode::Override, "X-Bare".into(), None));
        assert_eq!(Some(None), headers.get("x-bare"));
        assert_eq!(1, headers.remove("X-BARE"));
        assert!(!headers.contains("X-Bare"));
    }

    #[test]
    fn override_keeps_position() {
        let mut headers = table(&[("A", Some("1")), ("B", Some("2")), ("a", Some("3"))]);
        headers.add(AddMode::Override, "A".into(), Some("9".into()));
        assert_eq!(vec![("A", Some("9")), ("B", Some("2"))], headers.iter().collect::<Vec<_>>());
    }

    #[test]
    fn renders_block_with_terminator() {
        let headers = table(&[("Status", Some("200 OK")), ("X-Bare", None)]);
        let blocks = headers.render_blocks();
        assert_eq!(1, blocks.len());
        assert_eq!(&b"Status: 200 OK\r\nX-Bare: \r\n\r\n"[..], &blocks[0][..]);

        let blocks = HeaderTable::new().render_blocks();
        assert_eq!(vec![Bytes::from_static(b"\r\n")], blocks);
    }

    #[test]
    fn oversized_line_is_dropped() {
        let huge = "x".repeat(MAX_PAYLOAD);
        let headers = table(&[("A", Some("1")), ("Huge", Some(huge.as_str())), ("B", Some("2"))]);
        let blocks = headers.render_blocks();
        assert_eq!(1, blocks.len());
        assert_eq!(&b"A: 1\r\nB: 2\r\n\r\n"[..], &blocks[0][..]);
    }

    #[test]
    fn long_tables_span_several_blocks() {
        // 20000-byte values: two lines cannot share one payload.
        let value = "v".repeat(20000);
        let headers = table(&[("A", Some(value.as_str())), ("B", Some(value.as_str())), ("C", Some(value.as_str()))]);
        let blocks = headers.render_blocks();
        assert_eq!(3, blocks.len());
        assert!(blocks.iter().all(|b| b.len() <= MAX_PAYLOAD));
        assert!(blocks[0].starts_with(b"A: "));
        assert!(blocks[2].starts_with(b"C: "));
        assert!(blocks[2].ends_with(b"\r\n\r\n"));
        let total: usize = blocks.iter().map(|b| b.len()).sum();
        assert_eq!(3 * (20000 + 5) + 2, total);
    }
}
