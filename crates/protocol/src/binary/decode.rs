//! Node deserialization.
//!
//! Every read is bounds-checked and every count is compared with the
//! remaining input before anything is allocated, so a hostile peer can at
//! worst make us reject its frame.

use std::collections::BTreeMap;

use super::jid::{server_for_domain, Jid};
use super::tags::*;
use super::tokens;
use super::{BinaryNode, NodeContent, DEFAULT_MAX_DEPTH};
use crate::error::{ProtocolError, Result};

/// Parses exactly one node from `data` using the default depth limit.
pub fn decode_node(data: &[u8]) -> Result<BinaryNode> {
    decode_node_with_depth(data, DEFAULT_MAX_DEPTH)
}

/// Parses exactly one node, rejecting trees nested deeper than `max_depth`.
pub fn decode_node_with_depth(data: &[u8], max_depth: usize) -> Result<BinaryNode> {
    let mut reader = Reader {
        data,
        pos: 0,
        max_depth,
    };
    let node = reader.read_node(0)?;
    if reader.remaining() != 0 {
        return Err(ProtocolError::malformed(format!(
            "{} trailing bytes after node",
            reader.remaining()
        )));
    }
    Ok(node)
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
    max_depth: usize,
}

impl<'a> Reader<'a> {
    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn read_byte(&mut self) -> Result<u8> {
        let byte = *self
            .data
            .get(self.pos)
            .ok_or_else(|| ProtocolError::malformed("unexpected end of input"))?;
        self.pos += 1;
        Ok(byte)
    }

    fn read_slice(&mut self, len: usize) -> Result<&'a [u8]> {
        if len > self.remaining() {
            return Err(ProtocolError::malformed(format!(
                "length prefix {len} exceeds remaining {} bytes",
                self.remaining()
            )));
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn read_int(&mut self, width: usize) -> Result<usize> {
        let bytes = self.read_slice(width)?;
        Ok(bytes.iter().fold(0usize, |acc, &b| (acc << 8) | b as usize))
    }

    fn read_int20(&mut self) -> Result<usize> {
        let bytes = self.read_slice(3)?;
        Ok((((bytes[0] & 0x0f) as usize) << 16) | ((bytes[1] as usize) << 8) | bytes[2] as usize)
    }

    fn read_list_size(&mut self, tag: u8) -> Result<usize> {
        match tag {
            LIST_EMPTY => Ok(0),
            LIST_8 => Ok(self.read_byte()? as usize),
            LIST_16 => self.read_int(2),
            other => Err(ProtocolError::malformed(format!("invalid list tag {other}"))),
        }
    }

    fn read_node(&mut self, depth: usize) -> Result<BinaryNode> {
        if depth >= self.max_depth {
            return Err(ProtocolError::malformed(format!(
                "nesting deeper than {} levels",
                self.max_depth
            )));
        }

        let list_tag = self.read_byte()?;
        let size = self.read_list_size(list_tag)?;
        if size == 0 {
            return Err(ProtocolError::malformed("node list is empty"));
        }
        // Every entry after the tag takes at least one byte.
        if size - 1 > self.remaining() {
            return Err(ProtocolError::malformed(format!(
                "node of {size} entries exceeds remaining input"
            )));
        }

        let tag = self.read_string()?;
        if tag.is_empty() {
            return Err(ProtocolError::malformed("node tag is empty"));
        }

        let mut attrs = BTreeMap::new();
        for _ in 0..(size - 1) / 2 {
            let key = self.read_string()?;
            let value = self.read_string()?;
            attrs.insert(key, value);
        }

        let content = if size % 2 == 0 {
            self.read_content(depth)?
        } else {
            NodeContent::None
        };

        Ok(BinaryNode {
            tag,
            attrs,
            content,
        })
    }

    fn read_content(&mut self, depth: usize) -> Result<NodeContent> {
        let tag = self.read_byte()?;
        match tag {
            LIST_EMPTY | LIST_8 | LIST_16 => {
                let count = self.read_list_size(tag)?;
                if count > self.remaining() {
                    return Err(ProtocolError::malformed(format!(
                        "list of {count} children exceeds remaining input"
                    )));
                }
                let mut children = Vec::with_capacity(count);
                for _ in 0..count {
                    children.push(self.read_node(depth + 1)?);
                }
                Ok(NodeContent::Nodes(children))
            }
            BINARY_8 | BINARY_20 | BINARY_32 => Ok(NodeContent::Bytes(self.read_binary(tag)?.to_vec())),
            other => Ok(NodeContent::Bytes(self.read_string_body(other, true)?.into_bytes())),
        }
    }

    fn read_binary(&mut self, tag: u8) -> Result<&'a [u8]> {
        let len = match tag {
            BINARY_8 => self.read_byte()? as usize,
            BINARY_20 => self.read_int20()?,
            _ => self.read_int(4)?,
        };
        self.read_slice(len)
    }

    fn read_string(&mut self) -> Result<String> {
        let tag = self.read_byte()?;
        self.read_string_body(tag, true)
    }

    /// Address components may not themselves be addresses.
    fn read_jid_part(&mut self) -> Result<String> {
        let tag = self.read_byte()?;
        self.read_string_body(tag, false)
    }

    fn read_string_body(&mut self, tag: u8, allow_jid: bool) -> Result<String> {
        match tag {
            LIST_EMPTY => Ok(String::new()),
            DICTIONARY_0..=DICTIONARY_3 => {
                let dict = tag - DICTIONARY_0;
                let index = self.read_byte()?;
                tokens::double_byte(dict, index)
                    .map(String::from)
                    .ok_or_else(|| {
                        ProtocolError::malformed(format!(
                            "invalid dictionary index {index} in dictionary {dict}"
                        ))
                    })
            }
            LIST_8 | LIST_16 => Err(ProtocolError::malformed(
                "list found where a string was expected",
            )),
            BINARY_8 | BINARY_20 | BINARY_32 => {
                let bytes = self.read_binary(tag)?;
                String::from_utf8(bytes.to_vec())
                    .map_err(|_| ProtocolError::malformed("string literal is not valid UTF-8"))
            }
            NIBBLE_8 | HEX_8 => self.read_packed(tag),
            JID_PAIR | AD_JID if !allow_jid => {
                Err(ProtocolError::malformed("nested address inside an address"))
            }
            JID_PAIR => {
                let user = self.read_jid_part()?;
                let server = self.read_jid_part()?;
                if server.is_empty() {
                    return Err(ProtocolError::malformed("address without a server"));
                }
                Ok(Jid::new(user, server).to_string())
            }
            AD_JID => {
                let domain = self.read_byte()?;
                let device = self.read_byte()?;
                let user = self.read_jid_part()?;
                let server = server_for_domain(domain).ok_or_else(|| {
                    ProtocolError::malformed(format!("unknown address domain {domain}"))
                })?;
                Ok(Jid::with_device(user, device as u16, server).to_string())
            }
            index => tokens::single_byte(index)
                .map(String::from)
                .ok_or_else(|| ProtocolError::malformed(format!("invalid token index {index}"))),
        }
    }

    fn read_packed(&mut self, tag: u8) -> Result<String> {
        let header = self.read_byte()?;
        let bytes = self.read_slice((header & 0x7f) as usize)?;
        let mut value = String::with_capacity(bytes.len() * 2);
        for &byte in bytes {
            value.push(unpack(tag, byte >> 4)?);
            value.push(unpack(tag, byte & 0x0f)?);
        }
        if header & 0x80 != 0 {
            value.pop();
        }
        Ok(value)
    }
}

fn unpack(tag: u8, nibble: u8) -> Result<char> {
    match (tag, nibble) {
        (_, 0..=9) => Ok((b'0' + nibble) as char),
        (NIBBLE_8, 10) => Ok('-'),
        (NIBBLE_8, 11) => Ok('.'),
        (NIBBLE_8, 15) => Ok('\0'),
        (HEX_8, 10..=15) => Ok((b'A' + nibble - 10) as char),
        _ => Err(ProtocolError::malformed(format!(
            "invalid packed digit {nibble}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binary::encode_node;

    fn sample_message() -> BinaryNode {
        BinaryNode::new("message")
            .with_attr("id", "3EB0C431C26A1916E07E")
            .with_attr("to", "120363025246125486@g.us")
            .with_attr("type", "text")
            .with_attr("phash", "2:q6pJfqzG")
            .with_attr("custom-attribute", "héllo wörld")
            .with_children(vec![
                BinaryNode::new("participants").with_children(vec![BinaryNode::new("to")
                    .with_attr("jid", "15551234567:2@s.whatsapp.net")
                    .with_children(vec![BinaryNode::new("enc")
                        .with_attr("v", "2")
                        .with_attr("type", "pkmsg")
                        .with_bytes(vec![0x33, 0xff, 0x00, 0x10])])]),
                BinaryNode::new("enc")
                    .with_attr("v", "2")
                    .with_attr("type", "skmsg")
                    .with_bytes(vec![1u8; 700]),
                BinaryNode::new("device-identity").with_bytes(Vec::new()),
                BinaryNode::new("meta").with_children(Vec::new()),
            ])
    }

    #[test]
    fn test_roundtrip_sample_message() {
        let node = sample_message();
        let bytes = encode_node(&node).unwrap();
        assert_eq!(decode_node(&bytes).unwrap(), node);
    }

    #[test]
    fn test_roundtrip_addresses() {
        for jid in [
            "15551234567@s.whatsapp.net",
            "15551234567:12@s.whatsapp.net",
            "98765:3@lid",
            "120363025246125486@g.us",
            "status@broadcast",
            "15551234567:300@s.whatsapp.net",
            "user@example.org",
        ] {
            let node = BinaryNode::new("item").with_attr("jid", jid);
            let bytes = encode_node(&node).unwrap();
            assert_eq!(decode_node(&bytes).unwrap(), node, "{jid}");
        }
    }

    #[test]
    fn test_roundtrip_secondary_dictionary() {
        let token = tokens::DOUBLE_BYTE_TOKENS[1][0];
        let node = BinaryNode::new("item").with_attr("name", token);
        let bytes = encode_node(&node).unwrap();
        assert!(bytes.contains(&DICTIONARY_1));
        assert_eq!(decode_node(&bytes).unwrap(), node);
    }

    #[test]
    fn test_string_content_decodes_as_bytes() {
        // <body>ping</body> with the content written as a token
        let body = tokens::lookup("body");
        assert!(body.is_none());
        let ping = match tokens::lookup("ping") {
            Some(tokens::Token::Single(i)) => i,
            _ => panic!("ping should be a primary token"),
        };
        let bytes = vec![LIST_8, 2, BINARY_8, 4, b'b', b'o', b'd', b'y', ping];
        let node = decode_node(&bytes).unwrap();
        assert_eq!(node.bytes(), Some(&b"ping"[..]));
    }

    #[test]
    fn test_truncated_input_is_malformed() {
        let bytes = encode_node(&sample_message()).unwrap();
        for len in 0..bytes.len() {
            let err = decode_node(&bytes[..len]).unwrap_err();
            assert!(
                matches!(err, ProtocolError::MalformedNode(_)),
                "len={len}: {err}"
            );
        }
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = encode_node(&BinaryNode::new("ping")).unwrap();
        bytes.push(0);
        assert!(decode_node(&bytes).is_err());
    }

    #[test]
    fn test_empty_list_rejected() {
        assert!(decode_node(&[LIST_EMPTY]).is_err());
        assert!(decode_node(&[LIST_8, 0]).is_err());
    }

    #[test]
    fn test_empty_tag_rejected() {
        assert!(decode_node(&[LIST_8, 1, LIST_EMPTY]).is_err());
    }

    #[test]
    fn test_invalid_dictionary_index() {
        let err = decode_node(&[LIST_8, 1, DICTIONARY_3, 250]).unwrap_err();
        assert!(err.to_string().contains("invalid dictionary index"));
    }

    #[test]
    fn test_invalid_token_index() {
        let err = decode_node(&[LIST_8, 1, 240]).unwrap_err();
        assert!(err.to_string().contains("invalid token index"));
    }

    #[test]
    fn test_invalid_utf8_attribute() {
        let bytes = vec![LIST_8, 3, BINARY_8, 1, b'a', BINARY_8, 1, b'k', BINARY_8, 1, 0xff];
        assert!(decode_node(&bytes).is_err());
    }

    #[test]
    fn test_oversized_length_prefix() {
        let bytes = vec![LIST_8, 1, BINARY_32, 0xff, 0xff, 0xff, 0xff, b'x'];
        let err = decode_node(&bytes).unwrap_err();
        assert!(err.to_string().contains("exceeds remaining"));
    }

    #[test]
    fn test_child_count_checked_before_allocation() {
        let bytes = vec![LIST_8, 2, BINARY_8, 1, b'a', LIST_16, 0xff, 0xff];
        let err = decode_node(&bytes).unwrap_err();
        assert!(err.to_string().contains("exceeds remaining input"));
    }

    #[test]
    fn test_nested_jid_rejected() {
        let bytes = vec![LIST_8, 1, JID_PAIR, JID_PAIR, LIST_EMPTY, LIST_EMPTY, 3];
        let err = decode_node(&bytes).unwrap_err();
        assert!(err.to_string().contains("nested address"));
    }

    #[test]
    fn test_unknown_address_domain() {
        let bytes = vec![LIST_8, 1, AD_JID, 9, 1, LIST_EMPTY];
        assert!(decode_node(&bytes).is_err());
    }

    #[test]
    fn test_depth_limit_enforced() {
        let mut node = BinaryNode::new("leaf");
        for _ in 0..70 {
            node = BinaryNode::new("wrap").with_children(vec![node]);
        }
        let bytes = crate::binary::encode_node_with_depth(&node, 128).unwrap();
        let err = decode_node(&bytes).unwrap_err();
        assert!(err.to_string().contains("nesting deeper"));
        assert_eq!(decode_node_with_depth(&bytes, 128).unwrap(), node);
    }

    #[test]
    fn test_invalid_packed_digit() {
        let bytes = vec![LIST_8, 1, NIBBLE_8, 1, 0xcc];
        assert!(decode_node(&bytes).is_err());
    }
}
