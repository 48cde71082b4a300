use super::ByteStr;

/// Sentinel for a size that has not been computed yet.
const UNSIZED: i32 = -1;

/// A string paired with its precomputed wire size.
///
/// Message length precomputation needs the encoded byte count of every
/// string in the message. Computing it once and carrying it with the value
/// avoids re-measuring the SQL text for each pipelined write.
///
/// The size is the UTF-8 byte count of the value, excluding the nul
/// terminator the wire adds. Invariant: once computed, `size == value.len()`.
#[derive(Clone, Default)]
pub struct SizedStr {
    value: ByteStr,
    size: i32,
}

impl SizedStr {
    /// Create an unsized string; the size is computed on first use.
    pub fn new(value: impl Into<ByteStr>) -> Self {
        Self { value: value.into(), size: UNSIZED }
    }

    /// Compute and cache the wire size, returning it.
    ///
    /// Idempotent.
    ///
    /// # Panics
    ///
    /// Panics if the value exceeds `i32::MAX` bytes, which the protocol
    /// cannot frame.
    pub fn ensure_sized(&mut self) -> i32 {
        if self.size < 0 {
            self.size = i32::try_from(self.value.len())
                .expect("string too large for protocol");
        }
        debug_assert_eq!(self.size as usize, self.value.len());
        self.size
    }

    /// The cached size, if computed.
    pub fn size(&self) -> Option<i32> {
        (self.size >= 0).then_some(self.size)
    }

    /// Wire size including the nul terminator.
    ///
    /// # Panics
    ///
    /// Panics if the size was never computed.
    pub(crate) fn nul_len(&self) -> i32 {
        assert!(self.size >= 0, "SizedStr used before ensure_sized");
        self.size + 1
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }

    pub(crate) fn bytestr(&self) -> ByteStr {
        self.value.clone()
    }
}

impl From<&'static str> for SizedStr {
    fn from(value: &'static str) -> Self {
        Self::new(value)
    }
}

impl From<String> for SizedStr {
    fn from(value: String) -> Self {
        Self::new(ByteStr::from(value))
    }
}

impl std::fmt::Display for SizedStr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.value, f)
    }
}

impl std::fmt::Debug for SizedStr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SizedStr")
            .field("value", &self.value)
            .field("size", &self.size)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::SizedStr;

    #[test]
    fn size_matches_len() {
        let mut s = SizedStr::new("SELECT 'résumé'");
        assert_eq!(s.size(), None);
        let size = s.ensure_sized();
        assert_eq!(size as usize, "SELECT 'résumé'".len());
        // idempotent
        assert_eq!(s.ensure_sized(), size);
        assert_eq!(s.nul_len(), size + 1);
    }

    #[test]
    fn empty() {
        let mut s = SizedStr::new("");
        assert_eq!(s.ensure_sized(), 0);
        assert_eq!(s.nul_len(), 1);
    }
}
