//! Framing requests out of a staging buffer the way a connection handler does.

use memalloc::{BufferError, IoBuffer};

#[test]
fn lines_arrive_in_fragments() {
    let mut buffer = IoBuffer::new(16, 1024).unwrap();
    let stream = b"get a\r\nget bb\r\nset ccc 3\r\nxyz\r\n";
    let mut lines = Vec::new();

    for chunk in stream.chunks(5) {
        buffer.write(chunk).unwrap();
        loop {
            let line = buffer.try_read_until(b"\r\n");
            if line.is_empty() {
                break;
            }
            lines.push(String::from_utf8(line.to_vec()).unwrap());
        }
    }

    assert_eq!(vec!["get a\r\n", "get bb\r\n", "set ccc 3\r\n", "xyz\r\n"], lines);
    // Everything was consumed, the cursors are back at the start.
    assert_eq!(0, buffer.size());
}

#[test]
fn fixed_size_body_after_a_header_line() {
    let mut buffer = IoBuffer::default();
    buffer.write(b"set k 5\r\nhello\r\n").unwrap();

    assert_eq!(b"set k 5\r\n", buffer.try_read_until(b"\r\n"));
    assert_eq!(b"hello", buffer.complete_read(5));
    assert_eq!(b"\r\n", buffer.complete_read(2));
    assert_eq!(0, buffer.size());
}

#[test]
fn oversized_message_is_reported() {
    let mut buffer = IoBuffer::new(1024, 2048).unwrap();
    buffer.write(&[b'x'; 1500]).unwrap();

    let err = buffer.write(&[b'y'; 1000]).unwrap_err();
    assert_eq!(
        BufferError::CapacityExceeded {
            requested: 1000,
            max_size: 2048
        },
        err
    );
    // The failed write left the buffered bytes alone.
    assert_eq!(1500, buffer.non_read());
}
