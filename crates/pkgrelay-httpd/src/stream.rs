//! Channel-backed pipe used to bridge blocking producers (git archive,
//! vault reads) into streaming response bodies.

use std::io::{self, Read, Write};

use crossbeam::channel::{Receiver, Sender, bounded};

const PIPE_DEPTH: usize = 16;

pub(crate) fn pipe() -> (PipeWriter, PipeReader) {
    let (tx, rx) = bounded(PIPE_DEPTH);
    (
        PipeWriter { tx },
        PipeReader {
            rx,
            buf: Vec::new(),
            pos: 0,
        },
    )
}

pub(crate) struct PipeWriter {
    tx: Sender<Vec<u8>>,
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.tx
            .send(buf.to_vec())
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub(crate) struct PipeReader {
    rx: Receiver<Vec<u8>>,
    buf: Vec<u8>,
    pos: usize,
}

impl PipeReader {
    /// Block until the first chunk arrives. `false` means the writer
    /// finished without producing any bytes.
    pub(crate) fn wait_first(&mut self) -> bool {
        if !self.buf.is_empty() {
            return true;
        }
        match self.rx.recv() {
            Ok(chunk) => {
                self.buf = chunk;
                self.pos = 0;
                true
            }
            Err(_) => false,
        }
    }
}

impl Read for PipeReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.buf.len() {
            match self.rx.recv() {
                Ok(chunk) => {
                    self.buf = chunk;
                    self.pos = 0;
                }
                Err(_) => return Ok(0),
            }
        }
        let n = (self.buf.len() - self.pos).min(out.len());
        out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_flow_writer_to_reader() {
        let (mut writer, mut reader) = pipe();
        let handle = std::thread::spawn(move || {
            writer.write_all(b"hello ").expect("write");
            writer.write_all(b"world").expect("write");
        });

        assert!(reader.wait_first());
        let mut out = Vec::new();
        reader.read_to_end(&mut out).expect("read");
        assert_eq!(out, b"hello world");
        handle.join().expect("join");
    }

    #[test]
    fn empty_producer_reports_no_first_chunk() {
        let (writer, mut reader) = pipe();
        drop(writer);
        assert!(!reader.wait_first());
    }

    #[test]
    fn writer_fails_once_reader_is_gone() {
        let (mut writer, reader) = pipe();
        drop(reader);
        // the bounded queue absorbs a few chunks before the break shows
        let mut result = Ok(());
        for _ in 0..(PIPE_DEPTH + 2) {
            result = writer.write_all(b"chunk");
            if result.is_err() {
                break;
            }
        }
        assert!(result.is_err());
    }
}
