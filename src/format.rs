//! Element formats for typed buffers and textures.

/// Data formats understood by typed buffer and texture views.
#[allow(non_camel_case_types)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Format {
    R8_UNORM,
    R8_SNORM,
    R8_UINT,
    R8_SINT,
    R8G8B8A8_UNORM,
    R8G8B8A8_SNORM,
    R8G8B8A8_UINT,
    R8G8B8A8_SINT,
    R16_UINT,
    R16_SINT,
    R16_SFLOAT,
    R16G16_UINT,
    R16G16_SINT,
    R16G16_SFLOAT,
    R16G16B16A16_UINT,
    R16G16B16A16_SINT,
    R16G16B16A16_SFLOAT,
    R32_UINT,
    R32_SINT,
    R32_SFLOAT,
    R32G32_UINT,
    R32G32_SINT,
    R32G32_SFLOAT,
    R32G32B32A32_UINT,
    R32G32B32A32_SINT,
    R32G32B32A32_SFLOAT,
}

/// Static properties of a format.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FormatInfo {
    /// Size of one element in bytes.
    pub byte_size: usize,
    /// Number of components per element.
    pub channels: usize,
}

impl Format {
    pub fn info(self) -> FormatInfo {
        use Format::*;
        let (byte_size, channels) = match self {
            R8_UNORM | R8_SNORM | R8_UINT | R8_SINT => (1, 1),
            R8G8B8A8_UNORM | R8G8B8A8_SNORM | R8G8B8A8_UINT | R8G8B8A8_SINT => (4, 4),
            R16_UINT | R16_SINT | R16_SFLOAT => (2, 1),
            R16G16_UINT | R16G16_SINT | R16G16_SFLOAT => (4, 2),
            R16G16B16A16_UINT | R16G16B16A16_SINT | R16G16B16A16_SFLOAT => (8, 4),
            R32_UINT | R32_SINT | R32_SFLOAT => (4, 1),
            R32G32_UINT | R32G32_SINT | R32G32_SFLOAT => (8, 2),
            R32G32B32A32_UINT | R32G32B32A32_SINT | R32G32B32A32_SFLOAT => (16, 4),
        };
        FormatInfo { byte_size, channels }
    }

    /// Size of one element in bytes.
    pub fn byte_size(self) -> usize {
        self.info().byte_size
    }
}

impl Default for Format {
    fn default() -> Self {
        Format::R32G32B32A32_SFLOAT
    }
}
