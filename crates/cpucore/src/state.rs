//! Save state archives.
//!
//! An [`Archive`] is a cursor over a flat byte stream which is either being produced (write),
//! consumed (read) or only sized (measure). Every piece of state is transferred through the same
//! `do_state` function in all three modes, so the layout is defined by the order of the calls.

use easyerr::Error;
use zerocopy::{FromBytes, IntoBytes};

/// What an [`Archive`] is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Read,
    Write,
    Measure,
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("state ended at offset {offset} while {wanted} more bytes were expected")]
    Underflow { offset: usize, wanted: usize },
}

/// A save state archive.
#[derive(Debug)]
pub struct Archive {
    mode: Mode,
    data: Vec<u8>,
    cursor: usize,
    /// Set when a read went past the end of the data. Further reads are ignored.
    failed: Option<StateError>,
}

impl Archive {
    /// An archive which reads state from `data`.
    pub fn reader(data: Vec<u8>) -> Self {
        Self {
            mode: Mode::Read,
            data,
            cursor: 0,
            failed: None,
        }
    }

    /// An archive which writes state into a new buffer.
    pub fn writer() -> Self {
        Self {
            mode: Mode::Write,
            data: Vec::new(),
            cursor: 0,
            failed: None,
        }
    }

    /// An archive which only measures how large the state is.
    pub fn measurer() -> Self {
        Self {
            mode: Mode::Measure,
            data: Vec::new(),
            cursor: 0,
            failed: None,
        }
    }

    #[inline(always)]
    pub fn mode(&self) -> Mode {
        self.mode
    }

    #[inline(always)]
    pub fn is_reading(&self) -> bool {
        self.mode == Mode::Read
    }

    /// How many bytes have been transferred so far.
    #[inline(always)]
    pub fn position(&self) -> usize {
        self.cursor
    }

    /// Transfers raw bytes.
    pub fn bytes(&mut self, bytes: &mut [u8]) {
        match self.mode {
            Mode::Write => self.data.extend_from_slice(bytes),
            Mode::Measure => (),
            Mode::Read => {
                if self.failed.is_some() {
                    return;
                }

                let Some(src) = self.data.get(self.cursor..self.cursor + bytes.len()) else {
                    self.failed = Some(StateError::Underflow {
                        offset: self.cursor,
                        wanted: bytes.len(),
                    });
                    return;
                };

                bytes.copy_from_slice(src);
            }
        }

        self.cursor += bytes.len();
    }

    /// Transfers a plain value.
    #[inline(always)]
    pub fn value<T: IntoBytes + FromBytes>(&mut self, value: &mut T) {
        self.bytes(value.as_mut_bytes());
    }

    /// Transfers a slice of plain values.
    #[inline(always)]
    pub fn slice<T: IntoBytes + FromBytes>(&mut self, values: &mut [T]) {
        self.bytes(values.as_mut_bytes());
    }

    /// Transfers a boolean as a single byte.
    pub fn bool(&mut self, value: &mut bool) {
        let mut byte = *value as u8;
        self.value(&mut byte);
        *value = byte != 0;
    }

    /// Transfers a value through its `u32` representation.
    pub fn bits32<T>(&mut self, value: &mut T, to: impl FnOnce(&T) -> u32, from: impl FnOnce(u32) -> T) {
        let mut bits = to(value);
        self.value(&mut bits);
        if self.is_reading() {
            *value = from(bits);
        }
    }

    /// Finishes the archive, returning the written state (empty unless writing).
    pub fn finish(self) -> Result<Vec<u8>, StateError> {
        match self.failed {
            Some(err) => Err(err),
            None => Ok(self.data),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn transfer(ar: &mut Archive, a: &mut u32, b: &mut [u16; 3], c: &mut bool) {
        ar.value(a);
        ar.slice(b);
        ar.bool(c);
    }

    #[test]
    fn write_then_read() {
        let mut writer = Archive::writer();
        transfer(&mut writer, &mut 0xDEAD_BEEF, &mut [1, 2, 3], &mut true);
        let data = writer.finish().unwrap();

        let mut measurer = Archive::measurer();
        transfer(&mut measurer, &mut 0, &mut [0; 3], &mut false);
        assert_eq!(measurer.position(), data.len());

        let (mut a, mut b, mut c) = (0, [0; 3], false);
        let mut reader = Archive::reader(data);
        transfer(&mut reader, &mut a, &mut b, &mut c);
        reader.finish().unwrap();

        assert_eq!(a, 0xDEAD_BEEF);
        assert_eq!(b, [1, 2, 3]);
        assert!(c);
    }

    #[test]
    fn underflow_is_reported_at_finish() {
        let mut reader = Archive::reader(vec![1, 2, 3]);
        let mut a = 7u32;
        let mut b = 9u8;
        reader.value(&mut a);
        reader.value(&mut b);

        // failed reads leave the values untouched
        assert_eq!(a, 7);
        assert_eq!(b, 9);
        assert!(matches!(
            reader.finish(),
            Err(StateError::Underflow {
                offset: 0,
                wanted: 4
            })
        ));
    }
}
