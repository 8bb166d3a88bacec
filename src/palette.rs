use std::f32::consts::TAU;

use bitvec::{field::BitField, order::Lsb0, view::BitView};

/// Alpha used when packing palette colours for display. Opaque, to match the GPU path which
/// outputs an alpha of 1.0.
pub const ALPHA: u8 = 0xFF;

/// Number of entries in the palette. An index is a `u8`, so every index has a colour.
pub const PALETTE_SIZE: usize = 256;

// NTSC colour model parameters
const HUE_START: f32 = -0.58;
const HUE_STEP: f32 = TAU / 15.0;
const SATURATION: f32 = 0.22;
const BLACK_LEVEL: f32 = 0.04;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Pack the colour into a single 32-bit word which, stored little-endian, lays out as the
    /// R, G, B, A bytes of an RGBA8 surface.
    pub fn pack(self, alpha: u8) -> u32 {
        u32::from_le_bytes([self.r, self.g, self.b, alpha])
    }

    /// Normalized RGBA, as uploaded to the GPU.
    pub fn to_rgba_f32(self) -> [f32; 4] {
        [
            self.r as f32 / 255.0,
            self.g as f32 / 255.0,
            self.b as f32 / 255.0,
            1.0,
        ]
    }
}

/// The 256 entry colour table shared by both video paths.
///
/// Built once from the core's colour model and never mutated afterwards.
#[derive(Debug, Clone)]
pub struct Palette {
    rgb: [Rgb; PALETTE_SIZE],
    rgba: [[f32; 4]; PALETTE_SIZE],
}

impl Palette {
    pub fn init<F>(model: F) -> Self
    where
        F: Fn(u8) -> Rgb,
    {
        let mut rgb = [Rgb::default(); PALETTE_SIZE];
        let mut rgba = [[0.0; 4]; PALETTE_SIZE];
        for index in 0..=u8::MAX {
            let colour = model(index);
            rgb[index as usize] = colour;
            rgba[index as usize] = colour.to_rgba_f32();
        }

        Self { rgb, rgba }
    }

    #[inline]
    pub fn lookup(&self, index: u8) -> Rgb {
        self.rgb[index as usize]
    }

    /// Colour for `index` packed with the display alpha.
    #[inline]
    pub fn packed(&self, index: u8) -> u32 {
        self.lookup(index).pack(ALPHA)
    }

    pub fn rgba_f32(&self) -> &[[f32; 4]; PALETTE_SIZE] {
        &self.rgba
    }
}

/// Default colour model: 16 hues x 16 luminances, laid out as `hhhhllll`.
///
/// Hue 0 is the grey ramp; the other 15 hues are spread evenly around the NTSC colour wheel.
pub fn ntsc(index: u8) -> Rgb {
    let bits = index.view_bits::<Lsb0>();
    let luma = bits[0..4].load::<u8>();
    let hue = bits[4..8].load::<u8>();

    let y = BLACK_LEVEL + (1.0 - BLACK_LEVEL) * luma as f32 / 15.0;
    let (i, q) = if hue == 0 {
        (0.0, 0.0)
    } else {
        let angle = HUE_START + (hue - 1) as f32 * HUE_STEP;
        (SATURATION * angle.cos(), SATURATION * angle.sin())
    };

    // YIQ -> RGB
    let r = y + 0.956 * i + 0.621 * q;
    let g = y - 0.272 * i - 0.647 * q;
    let b = y - 1.106 * i + 1.703 * q;

    Rgb::new(to_channel(r), to_channel(g), to_channel(b))
}

fn to_channel(v: f32) -> u8 {
    (v.clamp(0.0, 1.0) * 255.0).round() as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_is_stable() {
        let palette = Palette::init(ntsc);
        let first: Vec<Rgb> = (0..=u8::MAX).map(|i| palette.lookup(i)).collect();
        for _ in 0..3 {
            for i in 0..=u8::MAX {
                assert_eq!(first[i as usize], palette.lookup(i));
                assert_eq!(ntsc(i), palette.lookup(i));
            }
        }
    }

    #[test]
    fn test_grey_ramp() {
        // Hue 0 has no chroma and gets brighter with the luminance
        let mut previous = 0;
        for luma in 0..16u8 {
            let c = ntsc(luma);
            assert_eq!(c.r, c.g);
            assert_eq!(c.g, c.b);
            assert!(c.r >= previous);
            previous = c.r;
        }
        assert_eq!(ntsc(0x0F), Rgb::new(255, 255, 255));
    }

    #[test]
    fn test_pack() {
        let c = Rgb::new(0x12, 0x34, 0x56);
        assert_eq!(c.pack(0xFF).to_le_bytes(), [0x12, 0x34, 0x56, 0xFF]);
    }

    #[test]
    fn test_normalized_matches_rgb() {
        let palette = Palette::init(ntsc);
        for i in 0..=u8::MAX {
            let rgb = palette.lookup(i);
            let rgba = palette.rgba_f32()[i as usize];
            assert_eq!((rgba[0] * 255.0).round() as u8, rgb.r);
            assert_eq!((rgba[1] * 255.0).round() as u8, rgb.g);
            assert_eq!((rgba[2] * 255.0).round() as u8, rgb.b);
            assert_eq!(rgba[3], 1.0);
        }
    }
}
