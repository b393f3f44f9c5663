//! Firmware image uploaded to the chip at every boot.

use super::AsicError;

pub const IMAGE_LEN: usize = 2048;
pub const PAGE_LEN: usize = 128;

/// An immutable firmware image of exactly [`IMAGE_LEN`] bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirmwareImage<'a> {
    bytes: &'a [u8],
}

/// One bus write worth of image data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page<'a> {
    pub offset: usize,
    pub data: &'a [u8],
    /// The final page closes the transfer with a stop condition.
    pub last: bool,
}

impl<'a> FirmwareImage<'a> {
    pub fn new(bytes: &'a [u8]) -> Result<Self, AsicError> {
        if bytes.len() != IMAGE_LEN {
            return Err(AsicError::FirmwareSize {
                expected: IMAGE_LEN,
                actual: bytes.len(),
            });
        }
        Ok(Self { bytes })
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// Value for the transfer-count register: image length minus one.
    pub fn transfer_count(&self) -> u16 {
        (self.bytes.len() - 1) as u16
    }

    pub fn pages(&self) -> impl Iterator<Item = Page<'a>> + 'a {
        let len = self.bytes.len();
        self.bytes
            .chunks(PAGE_LEN)
            .enumerate()
            .map(move |(index, data)| {
                let offset = index * PAGE_LEN;
                Page {
                    offset,
                    data,
                    last: offset + PAGE_LEN >= len,
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn test_image_is_sixteen_pages_with_final_stop() {
        let bytes = vec![0u8; IMAGE_LEN];
        let image = FirmwareImage::new(&bytes).unwrap();
        let pages: alloc::vec::Vec<_> = image.pages().collect();

        assert_eq!(pages.len(), 16);
        assert!(pages.iter().all(|p| p.data.len() == PAGE_LEN));
        assert_eq!(pages.iter().filter(|p| p.last).count(), 1);
        assert!(pages[15].last);
        assert_eq!(pages[15].offset, 1920);
        assert_eq!(image.transfer_count(), 0x07FF);
    }

    #[test]
    fn test_wrong_size_rejected() {
        let bytes = vec![0u8; 1000];
        assert_eq!(
            FirmwareImage::new(&bytes),
            Err(AsicError::FirmwareSize {
                expected: IMAGE_LEN,
                actual: 1000
            })
        );
    }
}
