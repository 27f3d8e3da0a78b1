//! Framed object-content protocol.
//!
//! Requests are one object id per line. Each response is a header line
//! `<id> <kind> <size>`, exactly `size` content bytes and one newline, or the
//! single line `<id> missing`. Any deviation means the stream can no longer
//! be trusted, so it is reported as a desync instead of resynchronised.

use anyhow::{Context, Result};
use std::io::{BufRead, Read, Write};

use crate::error::BuildError;

/// One decoded response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Object {
        object: String,
        kind: String,
        data: Vec<u8>,
    },
    Missing {
        object: String,
    },
}

impl Frame {
    pub fn object(&self) -> &str {
        match self {
            Frame::Object { object, .. } | Frame::Missing { object } => object,
        }
    }
}

fn desync(msg: impl Into<String>) -> anyhow::Error {
    BuildError::ProtocolDesync(msg.into()).into()
}

/// Write one request line per object and flush.
pub fn write_requests<W: Write>(writer: &mut W, objects: &[String]) -> Result<()> {
    for object in objects {
        writeln!(writer, "{object}").context("writing batch request")?;
    }
    writer.flush().context("flushing batch requests")?;
    Ok(())
}

/// Read the next response frame.
pub fn read_frame<R: BufRead>(reader: &mut R) -> Result<Frame> {
    let mut header = String::new();
    let n = reader
        .read_line(&mut header)
        .context("reading batch response header")?;
    if n == 0 {
        return Err(desync("stream ended before the expected response"));
    }
    let header = header
        .strip_suffix('\n')
        .ok_or_else(|| desync(format!("truncated header '{header}'")))?;

    let fields: Vec<&str> = header.split(' ').collect();
    match fields.as_slice() {
        [object, "missing"] => Ok(Frame::Missing {
            object: object.to_string(),
        }),
        [object, kind, size] => {
            let size: usize = size
                .parse()
                .map_err(|_| desync(format!("bad size in header '{header}'")))?;
            let mut data = vec![0; size];
            reader
                .read_exact(&mut data)
                .map_err(|_| desync(format!("content of {object} shorter than {size} bytes")))?;
            let mut separator = [0u8; 1];
            reader
                .read_exact(&mut separator)
                .map_err(|_| desync(format!("missing separator after {object}")))?;
            if separator[0] != b'\n' {
                return Err(desync(format!("content of {object} longer than {size} bytes")));
            }
            Ok(Frame::Object {
                object: object.to_string(),
                kind: kind.to_string(),
                data,
            })
        }
        _ => Err(desync(format!("malformed header '{header}'"))),
    }
}

/// Read one frame per requested object, in request order.
///
/// `paths` names each object for error messages.
pub fn read_responses<R: BufRead>(
    reader: &mut R,
    objects: &[String],
    paths: &[String],
) -> Result<Vec<Vec<u8>>> {
    let mut contents = Vec::with_capacity(objects.len());
    for (i, expected) in objects.iter().enumerate() {
        let path = paths.get(i).map(String::as_str).unwrap_or("?");
        match read_frame(reader)? {
            Frame::Missing { object } if object == *expected => {
                return Err(BuildError::MissingObject {
                    object,
                    path: path.to_string(),
                }
                .into());
            }
            Frame::Object { object, data, .. } if object == *expected => contents.push(data),
            frame => {
                return Err(desync(format!(
                    "expected {expected} for '{path}', got {}",
                    frame.object()
                )))
            }
        }
    }
    Ok(contents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_requests_are_newline_separated() {
        let mut out = Vec::new();
        write_requests(&mut out, &ids(&["aaa", "bbb"])).unwrap();
        assert_eq!(out, b"aaa\nbbb\n");
    }

    #[test]
    fn test_reads_frames_in_order() {
        let stream = b"aaa blob 5\nhello\nbbb blob 0\n\n";
        let got = read_responses(
            &mut Cursor::new(&stream[..]),
            &ids(&["aaa", "bbb"]),
            &ids(&["a.txt", "empty"]),
        )
        .unwrap();
        assert_eq!(got, vec![b"hello".to_vec(), Vec::new()]);
    }

    #[test]
    fn test_content_may_contain_newlines() {
        let stream = b"aaa blob 4\na\nb\n\n";
        let frame = read_frame(&mut Cursor::new(&stream[..])).unwrap();
        match frame {
            Frame::Object { data, kind, .. } => {
                assert_eq!(data, b"a\nb\n");
                assert_eq!(kind, "blob");
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn test_missing_object_names_path() {
        let stream = b"aaa missing\n";
        let err = read_responses(&mut Cursor::new(&stream[..]), &ids(&["aaa"]), &ids(&["src/x.c"]))
            .unwrap_err();
        match err.downcast_ref::<BuildError>() {
            Some(BuildError::MissingObject { path, .. }) => assert_eq!(path, "src/x.c"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_desync_cases() {
        let cases: [(&[u8], &[&str]); 5] = [
            (b"bbb blob 1\nx\n", &["aaa"]),
            (b"aaa blob 5\nhi\n", &["aaa"]),
            (b"aaa blob 1\nxy\n", &["aaa"]),
            (b"aaa blob one\nx\n", &["aaa"]),
            (b"aaa blob 1\nx\n", &["aaa", "bbb"]),
        ];
        for (stream, objects) in cases {
            let err = read_responses(&mut Cursor::new(stream), &ids(objects), &[]).unwrap_err();
            assert!(
                matches!(err.downcast_ref::<BuildError>(), Some(BuildError::ProtocolDesync(_))),
                "{:?}: {err:?}",
                String::from_utf8_lossy(stream)
            );
        }
    }
}
