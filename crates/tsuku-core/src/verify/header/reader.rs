//! Bounds-checked field access over an untrusted byte image.
//!
//! Every read goes through `slice::get` with checked offset arithmetic, so a
//! malformed table can only ever produce [`HeaderError::Truncated`].

use super::HeaderError;

/// Byte order of the image being parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Endian {
    Little,
    Big,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Reader<'a> {
    data: &'a [u8],
    endian: Endian,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(data: &'a [u8], endian: Endian) -> Self {
        Self { data, endian }
    }

    pub(crate) fn len(&self) -> usize {
        self.data.len()
    }

    pub(crate) fn bytes(&self, offset: usize, len: usize) -> Result<&'a [u8], HeaderError> {
        let end = offset.checked_add(len).ok_or(HeaderError::Truncated)?;
        self.data.get(offset..end).ok_or(HeaderError::Truncated)
    }

    fn array<const N: usize>(&self, offset: usize) -> Result<[u8; N], HeaderError> {
        let slice = self.bytes(offset, N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    pub(crate) fn u16(&self, offset: usize) -> Result<u16, HeaderError> {
        let raw = self.array::<2>(offset)?;
        Ok(match self.endian {
            Endian::Little => u16::from_le_bytes(raw),
            Endian::Big => u16::from_be_bytes(raw),
        })
    }

    pub(crate) fn u32(&self, offset: usize) -> Result<u32, HeaderError> {
        let raw = self.array::<4>(offset)?;
        Ok(match self.endian {
            Endian::Little => u32::from_le_bytes(raw),
            Endian::Big => u32::from_be_bytes(raw),
        })
    }

    pub(crate) fn u64(&self, offset: usize) -> Result<u64, HeaderError> {
        let raw = self.array::<8>(offset)?;
        Ok(match self.endian {
            Endian::Little => u64::from_le_bytes(raw),
            Endian::Big => u64::from_be_bytes(raw),
        })
    }

    /// Read a word whose width depends on the image class.
    pub(crate) fn word(&self, offset: usize, is_64: bool) -> Result<u64, HeaderError> {
        if is_64 {
            self.u64(offset)
        } else {
            self.u32(offset).map(u64::from)
        }
    }

    /// Read a NUL-terminated string starting at `offset`, never looking past
    /// `limit` bytes. A missing terminator inside the window is corruption.
    pub(crate) fn c_str(&self, offset: usize, limit: usize) -> Result<String, HeaderError> {
        let available = self.data.len().saturating_sub(offset).min(limit);
        let window = self.bytes(offset, available)?;
        let end = window
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| HeaderError::Corrupted("unterminated string table entry".into()))?;
        Ok(String::from_utf8_lossy(&window[..end]).into_owned())
    }
}

/// Convert a file-supplied 64-bit offset or size to `usize`.
pub(crate) fn to_usize(value: u64) -> Result<usize, HeaderError> {
    usize::try_from(value).map_err(|_| HeaderError::Truncated)
}
