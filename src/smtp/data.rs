//-
// Copyright (c) 2026, Jason Lingle
//
// This file is part of Mailslot.
//
// Mailslot is free software: you can  redistribute it and/or modify it under
// the terms of  the GNU General  Public License as published  by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Mailslot is distributed  in the hope that it will  be useful, but WITHOUT
// ANY WARRANTY;  without even  the implied warranty  of MERCHANTABILITY  or
// FITNESS FOR A PARTICULAR PURPOSE.  See the GNU General Public License for
// more details.
//
// You should have received a copy of the GNU General Public License along
// with Mailslot. If not, see <http://www.gnu.org/licenses/>.

//! DATA-mode framing.

use std::io;
use std::pin::Pin;

use tokio::io::{AsyncBufReadExt, AsyncReadExt};

/// Reads a message body from `src`, delivering it to `sink` in chunks, up to
/// and including the terminator line consisting of a single `.`.
///
/// Dot stuffing is removed: any line beginning with `.` (other than the
/// terminator) has that first `.` dropped. The terminator itself is consumed
/// but not delivered, and the CRLF that precedes it belongs to the content.
///
/// Line endings are passed through untouched; a bare LF is accepted as a
/// line ending everywhere, including on the terminator, so `.\n` also ends
/// the body. EOF before the terminator is an error.
pub(super) async fn read_body(
    mut src: Pin<&mut impl AsyncBufReadExt>,
    mut sink: impl FnMut(&[u8]),
) -> io::Result<()> {
    // Whether the next read is reading from the start of a line; i.e., true
    // at the beginning of the body and after each line ending. A '.' is only
    // special in that position, and the terminator check must also work when
    // the '.' arrives on its own at the end of a read.
    let mut start_of_line = true;

    loop {
        let mut src_ref = src.as_mut();
        let mut buffer = src_ref.fill_buf().await?;

        if buffer.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "EOF encountered in message data",
            ));
        }

        if let Some(eol) = memchr::memchr(b'\n', buffer) {
            buffer = &buffer[..=eol];
        }

        let buffer_len = buffer.len();

        if start_of_line {
            if b".\r\n" == buffer || b".\n" == buffer {
                // End of content
                src.as_mut().consume(buffer_len);
                break;
            }

            if b".\r" == buffer {
                // Maybe end of content, if we can get a \n next.
                src.as_mut().consume(buffer_len);

                let mut extra = [0u8; 1];
                src.as_mut().read_exact(&mut extra).await?;
                if b'\n' == extra[0] {
                    // End of content
                    break;
                }

                // Not the terminator, so the '.' was stuffing; the CR and
                // whatever followed it are content.
                sink(b"\r");
                sink(&extra);
                start_of_line = false;
                continue;
            }

            if b"." == buffer {
                // Could be end of content or a stuffed dot.
                src.as_mut().consume(buffer_len);

                let mut extra = [0u8; 2];
                src.as_mut().read_exact(&mut extra[..1]).await?;

                if b'\n' == extra[0] {
                    // End of content
                    break;
                }

                src.as_mut().read_exact(&mut extra[1..]).await?;

                if b"\r\n" == &extra {
                    // End of content
                    break;
                }

                // Stuffed dot. We know extra[0] is not '\n', so the only
                // possible line ending is at the end of `extra`.
                sink(&extra);
                start_of_line = extra.ends_with(b"\n");
                continue;
            }
        }

        // Else, everything inside buffer is content, except possibly a
        // leading stuffed '.'.
        let content = if start_of_line && b'.' == buffer[0] {
            &buffer[1..]
        } else {
            buffer
        };
        sink(content);

        start_of_line = buffer.ends_with(b"\n");
        src.as_mut().consume(buffer_len);
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use std::str;

    use proptest::prelude::*;

    use super::*;

    fn read_body_sync(stuffed: &[u8], buffer_size: usize) -> Vec<u8> {
        let mut decoded = Vec::<u8>::new();
        let mut reader =
            tokio::io::BufReader::with_capacity(buffer_size, stuffed);
        futures::executor::block_on(read_body(
            Pin::new(&mut reader),
            |chunk| decoded.extend_from_slice(chunk),
        ))
        .unwrap();

        decoded
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 4096,
            ..ProptestConfig::default()
        })]

        #[test]
        fn dot_stuffing_decodes_properly(
            content in "[x.\r\n]{0,100}\r\n",
            buffer_size in 1usize..=32,
        ) {
            let mut stuffed = content.replace("\n.", "\n..");
            if stuffed.starts_with('.') {
                stuffed = format!(".{}", stuffed);
            }
            stuffed.push_str(".\r\n");

            let decoded = read_body_sync(stuffed.as_bytes(), buffer_size);
            assert_eq!(content, str::from_utf8(&decoded).unwrap());
        }

        #[test]
        fn lf_terminated_body_decodes_properly(
            content in "[x.\n]{0,100}\n",
            buffer_size in 1usize..=32,
        ) {
            let mut stuffed = content.replace("\n.", "\n..");
            if stuffed.starts_with('.') {
                stuffed = format!(".{}", stuffed);
            }
            stuffed.push_str(".\n");

            let decoded = read_body_sync(stuffed.as_bytes(), buffer_size);
            assert_eq!(content, str::from_utf8(&decoded).unwrap());
        }
    }

    #[test]
    fn lone_stuffed_dot_becomes_dot() {
        assert_eq!(
            b".\r\n".to_vec(),
            read_body_sync(b"..\r\n.\r\n", 64),
        );
    }

    #[test]
    fn terminator_split_across_tiny_buffers() {
        // Forces the '.', CR, and LF of the terminator to arrive one byte at
        // a time.
        assert_eq!(
            b"body\r\n".to_vec(),
            read_body_sync(b"body\r\n.\r\n", 1),
        );
    }

    #[test]
    fn stuffed_dot_split_across_tiny_buffers() {
        assert_eq!(
            b".x\r\nrest\r\n".to_vec(),
            read_body_sync(b"..x\r\nrest\r\n.\r\n", 1),
        );
    }

    #[test]
    fn crlf_is_not_required_before_terminator_line() {
        assert_eq!(
            b"unix\nlines\n".to_vec(),
            read_body_sync(b"unix\nlines\n.\r\n", 64),
        );
    }

    #[test]
    fn cr_without_lf_is_content() {
        assert_eq!(
            b"a\rb\r\n".to_vec(),
            read_body_sync(b"a\rb\r\n.\r\n", 64),
        );
        // A stuffed dot followed by a bare CR
        assert_eq!(
            b"\rx\r\n".to_vec(),
            read_body_sync(b".\rx\r\n.\r\n", 2),
        );
    }

    #[test]
    fn eof_in_body_is_an_error() {
        let mut reader = tokio::io::BufReader::new(&b"no terminator\r\n"[..]);
        let result = futures::executor::block_on(read_body(
            Pin::new(&mut reader),
            |_| (),
        ));
        assert_eq!(
            io::ErrorKind::UnexpectedEof,
            result.unwrap_err().kind(),
        );
    }
}
