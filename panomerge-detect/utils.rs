/// Utility functions for corner detection algorithms

/// Check if there are at least `min_count` consecutive set bits in a circular 16-bit ring
/// using a branch-free bitmask approach
pub fn has_consecutive_bits(mask: u16, min_count: usize) -> bool {
    if min_count > 16 || min_count == 0 {
        return false;
    }
    if mask == u16::MAX {
        return true;
    }

    // A run of length n survives mask & rotl(mask, 1) & ... & rotl(mask, n - 1)
    let mut test_mask = mask;
    for i in 1..min_count {
        test_mask &= mask.rotate_left(i as u32);
        if test_mask == 0 {
            return false;
        }
    }

    test_mask != 0
}

/// Pack a circular boolean ring into a bitmask, bit `i` = `pixels[i]`
pub fn ring_mask(pixels: &[bool; 16]) -> u16 {
    pixels
        .iter()
        .enumerate()
        .fold(0u16, |mask, (i, &p)| if p { mask | (1 << i) } else { mask })
}

/// Percentile of a 256-bin histogram, `p` in [0, 100]
pub fn histogram_percentile(hist: &[u64; 256], p: f32) -> u8 {
    let total: u64 = hist.iter().sum();
    if total == 0 {
        return 0;
    }
    let target = ((p.clamp(0.0, 100.0) / 100.0) * (total - 1) as f32).round() as u64;
    let mut cumulative = 0u64;
    for (value, &count) in hist.iter().enumerate() {
        cumulative += count;
        if cumulative > target {
            return value as u8;
        }
    }
    255
}

pub fn histogram(img: &[u8]) -> [u64; 256] {
    let mut hist = [0u64; 256];
    for &v in img {
        hist[v as usize] += 1;
    }
    hist
}

pub fn mean_intensity(img: &[u8]) -> f32 {
    if img.is_empty() {
        return 0.0;
    }
    img.iter().map(|&v| v as u64).sum::<u64>() as f32 / img.len() as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring(set: impl IntoIterator<Item = usize>) -> [bool; 16] {
        let mut pixels = [false; 16];
        for i in set {
            pixels[i % 16] = true;
        }
        pixels
    }

    #[test]
    fn test_consecutive_pixels_simple() {
        let mask = ring_mask(&ring(0..9));
        assert!(has_consecutive_bits(mask, 9));
        assert!(!has_consecutive_bits(mask, 10));
    }

    #[test]
    fn test_consecutive_pixels_wrap_around() {
        let mask = ring_mask(&ring((12..16).chain(0..5)));
        assert!(has_consecutive_bits(mask, 9));
    }

    #[test]
    fn test_non_consecutive_pixels() {
        let mask = ring_mask(&ring((0..16).step_by(2)));
        assert!(!has_consecutive_bits(mask, 2));
        assert!(has_consecutive_bits(mask, 1));
        assert!(has_consecutive_bits(u16::MAX, 16));
    }

    #[test]
    fn test_percentiles() {
        let img: Vec<u8> = (0..=255u8).collect();
        let hist = histogram(&img);
        assert_eq!(histogram_percentile(&hist, 0.0), 0);
        assert_eq!(histogram_percentile(&hist, 100.0), 255);
        assert_eq!(histogram_percentile(&hist, 50.0), 128);
        assert!((mean_intensity(&img) - 127.5).abs() < 1e-3);
    }
}
