//! Node serialization.

use super::jid::{domain_type, Jid};
use super::tags::*;
use super::tokens::{self, Token};
use super::{BinaryNode, NodeContent, DEFAULT_MAX_DEPTH};
use crate::error::{ProtocolError, Result};

/// Serializes a node using the default depth limit.
pub fn encode_node(node: &BinaryNode) -> Result<Vec<u8>> {
    encode_node_with_depth(node, DEFAULT_MAX_DEPTH)
}

/// Serializes a node, rejecting trees nested deeper than `max_depth`.
pub fn encode_node_with_depth(node: &BinaryNode, max_depth: usize) -> Result<Vec<u8>> {
    let mut encoder = Encoder {
        out: Vec::with_capacity(64),
        max_depth,
    };
    encoder.write_node(node, 0)?;
    Ok(encoder.out)
}

struct Encoder {
    out: Vec<u8>,
    max_depth: usize,
}

impl Encoder {
    fn write_node(&mut self, node: &BinaryNode, depth: usize) -> Result<()> {
        if depth >= self.max_depth {
            return Err(ProtocolError::malformed(format!(
                "nesting deeper than {} levels",
                self.max_depth
            )));
        }
        if node.tag.is_empty() {
            return Err(ProtocolError::malformed("node tag must not be empty"));
        }

        let has_content = !matches!(node.content, NodeContent::None);
        let size = 1 + 2 * node.attrs.len() + usize::from(has_content);
        self.write_list_start(size)?;
        self.write_string(&node.tag)?;
        for (key, value) in &node.attrs {
            self.write_string(key)?;
            self.write_string(value)?;
        }

        match &node.content {
            NodeContent::None => {}
            NodeContent::Nodes(children) => {
                self.write_list_start(children.len())?;
                for child in children {
                    self.write_node(child, depth + 1)?;
                }
            }
            NodeContent::Bytes(bytes) => self.write_bytes(bytes)?,
        }
        Ok(())
    }

    fn write_list_start(&mut self, size: usize) -> Result<()> {
        if size == 0 {
            self.out.push(LIST_EMPTY);
        } else if size < 256 {
            self.out.push(LIST_8);
            self.out.push(size as u8);
        } else if size <= u16::MAX as usize {
            self.out.push(LIST_16);
            self.out.extend_from_slice(&(size as u16).to_be_bytes());
        } else {
            return Err(ProtocolError::malformed(format!(
                "list of {size} entries exceeds {}",
                u16::MAX
            )));
        }
        Ok(())
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let len = bytes.len();
        if len < 256 {
            self.out.push(BINARY_8);
            self.out.push(len as u8);
        } else if len < 1 << 20 {
            self.out.push(BINARY_20);
            self.out.push(((len >> 16) & 0x0f) as u8);
            self.out.push(((len >> 8) & 0xff) as u8);
            self.out.push((len & 0xff) as u8);
        } else {
            let len = u32::try_from(len).map_err(|_| {
                ProtocolError::malformed(format!("byte payload of {len} bytes is too long"))
            })?;
            self.out.push(BINARY_32);
            self.out.extend_from_slice(&len.to_be_bytes());
        }
        self.out.extend_from_slice(bytes);
        Ok(())
    }

    fn write_string(&mut self, value: &str) -> Result<()> {
        if value.is_empty() {
            self.out.push(LIST_EMPTY);
            return Ok(());
        }
        match tokens::lookup(value) {
            Some(Token::Single(index)) => {
                self.out.push(index);
                return Ok(());
            }
            Some(Token::Double(dict, index)) => {
                self.out.push(DICTIONARY_0 + dict);
                self.out.push(index);
                return Ok(());
            }
            None => {}
        }
        if is_packable(value, NIBBLE_8) {
            return self.write_packed(NIBBLE_8, value);
        }
        if is_packable(value, HEX_8) {
            return self.write_packed(HEX_8, value);
        }
        if let Some(jid) = encodable_jid(value) {
            if self.write_jid(&jid)? {
                return Ok(());
            }
        }
        self.write_bytes(value.as_bytes())
    }

    /// Writes a compact address. Returns false when no compact form applies.
    fn write_jid(&mut self, jid: &Jid) -> Result<bool> {
        match (jid.device, domain_type(&jid.server)) {
            (Some(device), Some(domain)) if device <= u8::MAX as u16 => {
                self.out.push(AD_JID);
                self.out.push(domain);
                self.out.push(device as u8);
                self.write_string(&jid.user)?;
                Ok(true)
            }
            (None, _) => {
                self.out.push(JID_PAIR);
                self.write_string(&jid.user)?;
                self.write_string(&jid.server)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn write_packed(&mut self, tag: u8, value: &str) -> Result<()> {
        let bytes = value.as_bytes();
        let mut header = bytes.len().div_ceil(2) as u8;
        if bytes.len() % 2 == 1 {
            header |= 0x80;
        }
        self.out.push(tag);
        self.out.push(header);
        for pair in bytes.chunks(2) {
            let high = pack_char(tag, pair[0])?;
            let low = match pair.get(1) {
                Some(&c) => pack_char(tag, c)?,
                None => 0x0f,
            };
            self.out.push((high << 4) | low);
        }
        Ok(())
    }
}

/// A string qualifies for a JID encoding only if it re-composes identically.
fn encodable_jid(value: &str) -> Option<Jid> {
    if !value.contains('@') {
        return None;
    }
    let jid = Jid::parse(value)?;
    (jid.to_string() == value).then_some(jid)
}

fn is_packable(value: &str, tag: u8) -> bool {
    if value.is_empty() || value.len() > PACKED_MAX {
        return false;
    }
    value.bytes().all(|c| match tag {
        NIBBLE_8 => c.is_ascii_digit() || c == b'-' || c == b'.',
        _ => c.is_ascii_digit() || (b'A'..=b'F').contains(&c),
    })
}

fn pack_char(tag: u8, c: u8) -> Result<u8> {
    match (tag, c) {
        (_, b'0'..=b'9') => Ok(c - b'0'),
        (NIBBLE_8, b'-') => Ok(10),
        (NIBBLE_8, b'.') => Ok(11),
        (HEX_8, b'A'..=b'F') => Ok(c - b'A' + 10),
        _ => Err(ProtocolError::malformed(format!(
            "character {:?} cannot be packed",
            c as char
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_minimal_node() {
        // <ping/>: list of one entry, then the token for "ping"
        let bytes = encode_node(&BinaryNode::new("ping")).unwrap();
        let Some(Token::Single(ping)) = tokens::lookup("ping") else {
            panic!("ping should be a primary token");
        };
        assert_eq!(bytes, vec![LIST_8, 1, ping]);
    }

    #[test]
    fn test_empty_string_is_list_empty() {
        let node = BinaryNode::new("iq").with_attr("to", "");
        let bytes = encode_node(&node).unwrap();
        assert_eq!(*bytes.last().unwrap(), LIST_EMPTY);
    }

    #[test]
    fn test_empty_tag_rejected() {
        let err = encode_node(&BinaryNode::new("")).unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedNode(_)));
    }

    #[test]
    fn test_nibble_packing() {
        let node = BinaryNode::new("iq").with_attr("t", "1700000000");
        let bytes = encode_node(&node).unwrap();
        // list header, tag, key token, NIBBLE_8, header, 5 packed bytes
        let packed = &bytes[bytes.len() - 7..];
        assert_eq!(packed[0], NIBBLE_8);
        assert_eq!(packed[1], 5);
        assert_eq!(packed[2], 0x17);
    }

    #[test]
    fn test_odd_length_sets_flag() {
        let node = BinaryNode::new("iq").with_attr("id", "123");
        let bytes = encode_node(&node).unwrap();
        let packed = &bytes[bytes.len() - 4..];
        assert_eq!(packed[0], NIBBLE_8);
        assert_eq!(packed[1], 0x80 | 2);
        assert_eq!(packed[3], 0x3f);
    }

    #[test]
    fn test_hex_packing() {
        let node = BinaryNode::new("message").with_attr("id", "3EB0ABCDEF");
        let bytes = encode_node(&node).unwrap();
        let packed = &bytes[bytes.len() - 7..];
        assert_eq!(packed[0], HEX_8);
        assert_eq!(packed[1], 5);
        assert_eq!(packed[2], 0x3E);
    }

    #[test]
    fn test_device_jid_uses_ad_jid() {
        let node = BinaryNode::new("to").with_attr("jid", "15551234567:2@s.whatsapp.net");
        let bytes = encode_node(&node).unwrap();
        let pos = bytes.iter().position(|&b| b == AD_JID).unwrap();
        assert_eq!(bytes[pos + 1], 0);
        assert_eq!(bytes[pos + 2], 2);
    }

    #[test]
    fn test_non_canonical_jid_is_literal() {
        // Leading zero on the device would not survive re-composition.
        let node = BinaryNode::new("to").with_attr("jid", "abc:02@s.whatsapp.net");
        let bytes = encode_node(&node).unwrap();
        assert!(!bytes.contains(&AD_JID));
        assert!(!bytes.contains(&JID_PAIR));
    }

    #[test]
    fn test_large_payload_uses_binary_20() {
        let node = BinaryNode::new("enc").with_bytes(vec![7u8; 300]);
        let bytes = encode_node(&node).unwrap();
        let header_len = bytes.len() - 300;
        assert_eq!(bytes[header_len - 4], BINARY_20);
        assert_eq!(&bytes[header_len - 3..header_len], &[0x00, 0x01, 0x2c]);
    }

    #[test]
    fn test_depth_limit() {
        let mut node = BinaryNode::new("leaf");
        for _ in 0..5 {
            node = BinaryNode::new("wrap").with_children(vec![node]);
        }
        assert!(encode_node_with_depth(&node, 6).is_ok());
        assert!(encode_node_with_depth(&node, 5).is_err());
    }
}
