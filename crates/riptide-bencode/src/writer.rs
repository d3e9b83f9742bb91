use crate::Value;

fn write_bytes(out: &mut Vec<u8>, b: &[u8]) {
    out.extend_from_slice(b.len().to_string().as_bytes());
    out.push(b':');
    out.extend_from_slice(b);
}

fn write_integer(out: &mut Vec<u8>, v: i64) {
    out.push(b'i');
    out.extend_from_slice(v.to_string().as_bytes());
    out.push(b'e');
}

/// Serialize a parsed value back to bytes. Dict keys come out sorted because
/// the parser stores them in a BTreeMap.
pub fn encode_value(value: &Value<'_>, out: &mut Vec<u8>) {
    match value {
        Value::Bytes(b) => write_bytes(out, b),
        Value::Integer(v) => write_integer(out, *v),
        Value::List(items) => {
            out.push(b'l');
            for item in items {
                encode_value(item, out);
            }
            out.push(b'e');
        }
        Value::Dict(dict, _) => {
            out.push(b'd');
            for (key, item) in dict {
                write_bytes(out, key);
                encode_value(item, out);
            }
            out.push(b'e');
        }
    }
}

/// Builds a bencoded dictionary directly into a byte vector.
///
/// Keys MUST be pushed in sorted order; this is asserted in debug builds.
/// Sorted emission is what makes resume data and extended handshakes
/// canonical without an intermediate tree.
pub struct DictBuilder {
    out: Vec<u8>,
    #[cfg(debug_assertions)]
    last_key: Vec<u8>,
}

impl DictBuilder {
    pub fn new() -> Self {
        Self {
            out: vec![b'd'],
            #[cfg(debug_assertions)]
            last_key: Vec::new(),
        }
    }

    fn key(&mut self, key: &str) {
        #[cfg(debug_assertions)]
        {
            debug_assert!(
                self.last_key.as_slice() < key.as_bytes(),
                "dict keys must be pushed in sorted order: {:?} then {:?}",
                String::from_utf8_lossy(&self.last_key),
                key
            );
            self.last_key = key.as_bytes().to_vec();
        }
        write_bytes(&mut self.out, key.as_bytes());
    }

    pub fn push_bytes(mut self, key: &str, value: &[u8]) -> Self {
        self.key(key);
        write_bytes(&mut self.out, value);
        self
    }

    pub fn push_str(self, key: &str, value: &str) -> Self {
        self.push_bytes(key, value.as_bytes())
    }

    pub fn push_integer(mut self, key: &str, value: i64) -> Self {
        self.key(key);
        write_integer(&mut self.out, value);
        self
    }

    pub fn push_raw(mut self, key: &str, encoded: &[u8]) -> Self {
        self.key(key);
        self.out.extend_from_slice(encoded);
        self
    }

    pub fn push_list(mut self, key: &str, list: ListBuilder) -> Self {
        self.key(key);
        self.out.extend_from_slice(&list.finish());
        self
    }

    pub fn push_dict(mut self, key: &str, dict: DictBuilder) -> Self {
        self.key(key);
        self.out.extend_from_slice(&dict.finish());
        self
    }

    pub fn finish(mut self) -> Vec<u8> {
        self.out.push(b'e');
        self.out
    }
}

impl Default for DictBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Companion to [`DictBuilder`] for bencoded lists.
#[derive(Default)]
pub struct ListBuilder {
    out: Vec<u8>,
}

impl ListBuilder {
    pub fn new() -> Self {
        Self { out: vec![b'l'] }
    }

    pub fn push_bytes(mut self, value: &[u8]) -> Self {
        write_bytes(&mut self.out, value);
        self
    }

    pub fn push_integer(mut self, value: i64) -> Self {
        write_integer(&mut self.out, value);
        self
    }

    pub fn push_list(mut self, list: ListBuilder) -> Self {
        self.out.extend_from_slice(&list.finish());
        self
    }

    pub fn finish(mut self) -> Vec<u8> {
        self.out.push(b'e');
        self.out
    }
}
