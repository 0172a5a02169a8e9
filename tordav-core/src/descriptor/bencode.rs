//! Bencode parsing logic and info hash calculation

use bytes::Bytes;
use sha1::{Digest, Sha1};

use super::{DescriptorError, DescriptorFile, InfoHash, TorrentDescriptor};

type BencodeDict<'a> = std::collections::HashMap<&'a [u8], bencode_rs::Value<'a>>;
type ParseResult<T> = Result<T, DescriptorError>;

fn malformed(reason: impl Into<String>) -> DescriptorError {
    DescriptorError::Malformed {
        reason: reason.into(),
    }
}

/// Bencode parsing utilities for descriptor metadata extraction.
pub struct BencodeParser;

impl BencodeParser {
    /// Parse descriptor bytes and extract torrent metadata
    ///
    /// # Errors
    ///
    /// - `DescriptorError::Malformed` - If bencode parsing or metadata extraction failed
    pub fn parse_descriptor(raw: Bytes) -> Result<TorrentDescriptor, DescriptorError> {
        let parsed = bencode_rs::Value::parse(&raw)
            .map_err(|e| malformed(format!("Bencode parsing failed: {e:?}")))?;

        let Some(root) = parsed.first() else {
            return Err(malformed("Empty bencode data"));
        };
        let bencode_rs::Value::Dictionary(dict) = root else {
            return Err(malformed("Root element must be dictionary"));
        };

        let info_bytes = Self::find_info_slice(&raw)?;
        let info_hash = Self::calculate_info_hash(info_bytes);

        let Some(bencode_rs::Value::Dictionary(info)) = dict.get(b"info".as_slice()) else {
            return Err(malformed("Missing or invalid 'info' dictionary"));
        };

        let name = Self::extract_string(info, b"name")?;
        let piece_length = Self::extract_length(info, b"piece length")?;
        let pieces = Self::extract_bytes(info, b"pieces")?;
        if !pieces.len().is_multiple_of(20) {
            return Err(malformed("Invalid pieces length"));
        }

        let files = if let Ok(length) = Self::extract_length(info, b"length") {
            vec![DescriptorFile {
                path: vec![name.clone()],
                length,
            }]
        } else if let Some(bencode_rs::Value::List(list)) = info.get(b"files".as_slice()) {
            Self::extract_files(list)?
        } else {
            return Err(malformed("Missing 'files' or 'length' field"));
        };
        let total_length = files.iter().map(|f| f.length).sum();

        let creation_date = match dict.get(b"creation date".as_slice()) {
            Some(bencode_rs::Value::Integer(secs)) => Some(*secs),
            _ => None,
        };

        Ok(TorrentDescriptor {
            info_hash,
            name,
            piece_length,
            total_length,
            files,
            creation_date,
            raw: raw.clone(),
        })
    }

    fn calculate_info_hash(info_bytes: &[u8]) -> InfoHash {
        let mut hasher = Sha1::new();
        hasher.update(info_bytes);
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&hasher.finalize());
        InfoHash::new(hash)
    }

    /// Locates the raw bytes of the top-level `info` value.
    ///
    /// Walks the root dictionary key by key so an "info" string nested in
    /// another value is never mistaken for the key.
    fn find_info_slice(data: &[u8]) -> ParseResult<&[u8]> {
        if data.first() != Some(&b'd') {
            return Err(malformed("Expected dictionary start"));
        }

        let mut pos = 1;
        while pos < data.len() && data[pos] != b'e' {
            let key_end = pos + Self::find_value_end(&data[pos..])?;
            let key = Self::string_contents(&data[pos..key_end])?;
            let value_end = key_end + Self::find_value_end(&data[key_end..])?;
            if key == b"info" {
                return Ok(&data[key_end..value_end]);
            }
            pos = value_end;
        }

        Err(malformed("Could not find info dictionary in data"))
    }

    fn string_contents(encoded: &[u8]) -> ParseResult<&[u8]> {
        let colon = encoded
            .iter()
            .position(|b| *b == b':')
            .ok_or_else(|| malformed("Dictionary key must be a string"))?;
        Ok(&encoded[colon + 1..])
    }

    /// Find the end position of the bencode value starting at `data[0]`
    ///
    /// # Errors
    ///
    /// - `DescriptorError::Malformed` - If the value is truncated or invalid
    pub fn find_value_end(data: &[u8]) -> Result<usize, DescriptorError> {
        let mut pos = 0;
        let mut depth = 0usize;

        loop {
            let Some(&byte) = data.get(pos) else {
                return Err(malformed("Incomplete bencode value"));
            };
            match byte {
                b'd' | b'l' => {
                    depth += 1;
                    pos += 1;
                }
                b'e' => {
                    if depth == 0 {
                        return Err(malformed("Unexpected end marker"));
                    }
                    depth -= 1;
                    pos += 1;
                }
                b'i' => {
                    let end = data[pos..]
                        .iter()
                        .position(|b| *b == b'e')
                        .ok_or_else(|| malformed("Unterminated integer"))?;
                    pos += end + 1;
                }
                b'0'..=b'9' => {
                    let colon = data[pos..]
                        .iter()
                        .position(|b| *b == b':')
                        .ok_or_else(|| malformed("Invalid string format"))?;
                    let length: usize = std::str::from_utf8(&data[pos..pos + colon])
                        .ok()
                        .and_then(|s| s.parse().ok())
                        .ok_or_else(|| malformed("Invalid string length"))?;
                    pos += colon + 1 + length;
                    if pos > data.len() {
                        return Err(malformed("String exceeds input"));
                    }
                }
                _ => return Err(malformed("Invalid bencode character")),
            }

            if depth == 0 {
                return Ok(pos);
            }
        }
    }

    fn extract_bytes<'a>(dict: &'a BencodeDict<'_>, key: &[u8]) -> ParseResult<&'a [u8]> {
        match dict.get(key) {
            Some(bencode_rs::Value::Bytes(bytes)) => Ok(bytes),
            _ => Err(malformed(format!(
                "Missing or invalid field: {:?}",
                String::from_utf8_lossy(key)
            ))),
        }
    }

    fn extract_string(dict: &BencodeDict<'_>, key: &[u8]) -> ParseResult<String> {
        let bytes = Self::extract_bytes(dict, key)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| {
            malformed(format!(
                "Invalid UTF-8 in field: {:?}",
                String::from_utf8_lossy(key)
            ))
        })
    }

    fn extract_length(dict: &BencodeDict<'_>, key: &[u8]) -> ParseResult<u64> {
        match dict.get(key) {
            Some(bencode_rs::Value::Integer(value)) if *value >= 0 => Ok(*value as u64),
            _ => Err(malformed(format!(
                "Missing or invalid integer field: {:?}",
                String::from_utf8_lossy(key)
            ))),
        }
    }

    /// Extract files information from a multi-file torrent
    fn extract_files(files_list: &[bencode_rs::Value<'_>]) -> ParseResult<Vec<DescriptorFile>> {
        let mut files = Vec::with_capacity(files_list.len());

        for file_value in files_list {
            let bencode_rs::Value::Dictionary(file_dict) = file_value else {
                return Err(malformed("Invalid file entry type"));
            };
            let length = Self::extract_length(file_dict, b"length")?;

            let Some(bencode_rs::Value::List(path_list)) = file_dict.get(b"path".as_slice())
            else {
                return Err(malformed("Missing or invalid path in file"));
            };

            let mut path = Vec::with_capacity(path_list.len());
            for component in path_list {
                let bencode_rs::Value::Bytes(component) = component else {
                    return Err(malformed("Invalid path component type"));
                };
                let component = String::from_utf8(component.to_vec())
                    .map_err(|_| malformed("Invalid UTF-8 in file path"))?;
                path.push(component);
            }

            files.push(DescriptorFile { path, length });
        }

        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SINGLE_FILE: &[u8] = b"d8:announce9:test.com:13:creation datei1700000000e4:infod6:lengthi1048576e4:name9:test.file12:piece lengthi32768e6:pieces20:\x01\x01\x01\x01\x01\x01\x01\x01\x01\x01\x01\x01\x01\x01\x01\x01\x01\x01\x01\x01ee";

    const MULTI_FILE: &[u8] = b"d4:infod5:filesld6:lengthi10e4:pathl1:a1:b5:c.txteed6:lengthi5e4:pathl1:a5:d.txteee4:name4:root12:piece lengthi16384e6:pieces20:aaaaaaaaaaaaaaaaaaaaee";

    #[test]
    fn test_find_value_end_simple() {
        let data = b"d3:keyi42ee";
        assert_eq!(BencodeParser::find_value_end(data).unwrap(), data.len());
    }

    #[test]
    fn test_find_value_end_nested_with_trailing_data() {
        let data = b"d3:keyd4:namei42eeeXYZ";
        assert_eq!(BencodeParser::find_value_end(data).unwrap(), data.len() - 3);
    }

    #[test]
    fn test_find_value_end_incomplete() {
        assert!(BencodeParser::find_value_end(b"d3:key").is_err());
        assert!(BencodeParser::find_value_end(b"d3:key999:").is_err());
    }

    #[test]
    fn test_parse_single_file_descriptor() {
        let descriptor = BencodeParser::parse_descriptor(Bytes::from_static(SINGLE_FILE)).unwrap();

        assert_eq!(descriptor.name, "test.file");
        assert_eq!(descriptor.piece_length, 32768);
        assert_eq!(descriptor.total_length, 1048576);
        assert_eq!(descriptor.creation_date, Some(1_700_000_000));
        assert_eq!(descriptor.files.len(), 1);
        assert_eq!(descriptor.files[0].path, vec!["test.file"]);
    }

    #[test]
    fn test_parse_multi_file_descriptor() {
        let descriptor = BencodeParser::parse_descriptor(Bytes::from_static(MULTI_FILE)).unwrap();

        assert_eq!(descriptor.name, "root");
        assert_eq!(descriptor.total_length, 15);
        assert_eq!(descriptor.creation_date, None);
        assert_eq!(descriptor.files[0].display_path(), "a/b/c.txt");
        assert_eq!(descriptor.files[0].length, 10);
        assert_eq!(descriptor.files[1].display_path(), "a/d.txt");
    }

    #[test]
    fn test_info_hash_covers_only_info_dictionary() {
        let descriptor = BencodeParser::parse_descriptor(Bytes::from_static(SINGLE_FILE)).unwrap();

        let start = SINGLE_FILE
            .windows(6)
            .position(|w| w == b"4:info")
            .unwrap()
            + 6;
        let info = &SINGLE_FILE[start..SINGLE_FILE.len() - 1];
        let expected = BencodeParser::calculate_info_hash(info);

        assert_eq!(descriptor.info_hash, expected);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(BencodeParser::parse_descriptor(Bytes::from_static(b"")).is_err());
        assert!(BencodeParser::parse_descriptor(Bytes::from_static(b"l4:teste")).is_err());
        assert!(BencodeParser::parse_descriptor(Bytes::from_static(b"d8:announce3:abce")).is_err());
    }

    #[test]
    fn test_parse_rejects_invalid_pieces_length() {
        let data = b"d4:infod6:lengthi1e4:name1:x12:piece lengthi16384e6:pieces19:aaaaaaaaaaaaaaaaaaaee";
        assert!(BencodeParser::parse_descriptor(Bytes::from_static(data)).is_err());
    }
}
