//! Barcode decoding
//!
//! EAN-13 and EAN-8 are read from horizontal and vertical scanlines in both
//! directions. Every line is binarized on its own, decoded from run widths and
//! checksum-validated; the value read on most lines wins. Other formats plug
//! in through [`BarcodeDecoder`].

use image::GrayImage;
use std::collections::HashMap;

use crate::flags::ResultType;
use crate::result::Point;

/// Scanlines sampled per axis
const LINES_PER_AXIS: u32 = 15;
/// Minimum spread between darkest and brightest sample on a line
const MIN_CONTRAST: u8 = 40;
/// Light margin required on both sides of a symbol, in modules
const QUIET_ZONE: f32 = 5.0;
/// Maximum summed deviation, in modules, of a digit from its pattern
const MAX_DIGIT_DISTANCE: f32 = 1.5;

/// Space/bar widths of the L code set, in modules. G is L reversed, R equals L.
const L_WIDTHS: [[u8; 4]; 10] = [
    [3, 2, 1, 1],
    [2, 2, 2, 1],
    [2, 1, 2, 2],
    [1, 4, 1, 1],
    [1, 1, 3, 2],
    [1, 2, 3, 1],
    [1, 1, 1, 4],
    [1, 3, 1, 2],
    [1, 2, 1, 3],
    [3, 1, 1, 2],
];

/// L/G parity of the six left digits, indexed by the implied first digit of EAN-13
const FIRST_DIGIT_PARITY: [&str; 10] = [
    "LLLLLL", "LLGLGG", "LLGGLG", "LLGGGL", "LGLLGG", "LGGLLG", "LGGGLL", "LGLGLG", "LGLGGL", "LGGLGL",
];

/// A barcode found in an image
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedBarcode {
    pub data: Vec<u8>,
    /// Top-left, top-right, bottom-right, bottom-left, in image pixels
    pub corners: Option<[Point; 4]>,
}

/// Decoder for a single barcode format
pub trait BarcodeDecoder: Send + Sync {
    /// The format this decoder produces; exactly one bit
    fn format(&self) -> ResultType;

    fn decode(&self, image: &GrayImage) -> Option<DecodedBarcode>;
}

/// Built-in EAN-13 reader
#[derive(Debug, Default, Clone, Copy)]
pub struct Ean13Decoder;

impl BarcodeDecoder for Ean13Decoder {
    fn format(&self) -> ResultType {
        ResultType::EAN13
    }

    fn decode(&self, image: &GrayImage) -> Option<DecodedBarcode> {
        scan(image, Symbology::Ean13)
    }
}

/// Built-in EAN-8 reader
#[derive(Debug, Default, Clone, Copy)]
pub struct Ean8Decoder;

impl BarcodeDecoder for Ean8Decoder {
    fn format(&self) -> ResultType {
        ResultType::EAN8
    }

    fn decode(&self, image: &GrayImage) -> Option<DecodedBarcode> {
        scan(image, Symbology::Ean8)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Symbology {
    Ean13,
    Ean8,
}

impl Symbology {
    /// Digits encoded on each side of the center guard
    fn side_digits(self) -> usize {
        match self {
            Symbology::Ean13 => 6,
            Symbology::Ean8 => 4,
        }
    }

    fn run_count(self) -> usize {
        3 + 4 * self.side_digits() + 5 + 4 * self.side_digits() + 3
    }

    fn module_count(self) -> f32 {
        (3 + 7 * self.side_digits() + 5 + 7 * self.side_digits() + 3) as f32
    }
}

#[derive(Debug, Clone, Copy)]
struct Run {
    start: usize,
    len: usize,
    dark: bool,
}

/// Pixel values along a line with the mapping back to image coordinates
struct Scanline {
    values: Vec<u8>,
    origin: (f32, f32),
    step: (f32, f32),
}

impl Scanline {
    fn point(&self, offset: f32) -> Point {
        Point::new(
            self.origin.0 + self.step.0 * offset,
            self.origin.1 + self.step.1 * offset,
        )
    }

    fn reversed(&self) -> Self {
        let last = self.values.len().saturating_sub(1) as f32;
        let end = self.point(last);
        Self {
            values: self.values.iter().rev().copied().collect(),
            origin: (end.x, end.y),
            step: (-self.step.0, -self.step.1),
        }
    }
}

fn scanlines(image: &GrayImage) -> Vec<Scanline> {
    let (w, h) = image.dimensions();
    let mut lines = Vec::with_capacity(4 * LINES_PER_AXIS as usize);

    for k in 1..=LINES_PER_AXIS {
        let y = h * k / (LINES_PER_AXIS + 1);
        lines.push(Scanline {
            values: (0..w).map(|x| image.get_pixel(x, y).0[0]).collect(),
            origin: (0.0, y as f32),
            step: (1.0, 0.0),
        });
        let x = w * k / (LINES_PER_AXIS + 1);
        lines.push(Scanline {
            values: (0..h).map(|y| image.get_pixel(x, y).0[0]).collect(),
            origin: (x as f32, 0.0),
            step: (0.0, 1.0),
        });
    }

    let reversed: Vec<Scanline> = lines.iter().map(Scanline::reversed).collect();
    lines.extend(reversed);
    lines
}

/// Smooth with a [1,2,1] kernel, threshold at mid-range and run-length encode
fn binarize(values: &[u8]) -> Option<Vec<Run>> {
    if values.len() < 3 {
        return None;
    }
    let last = values.len() - 1;
    let smoothed: Vec<u8> = (0..values.len())
        .map(|i| {
            let prev = values[i.saturating_sub(1)] as u16;
            let next = values[(i + 1).min(last)] as u16;
            ((prev + 2 * values[i] as u16 + next) / 4) as u8
        })
        .collect();

    let min = *smoothed.iter().min()?;
    let max = *smoothed.iter().max()?;
    if max - min < MIN_CONTRAST {
        return None;
    }
    let threshold = ((min as u16 + max as u16) / 2) as u8;

    let mut runs: Vec<Run> = Vec::new();
    for (i, &v) in smoothed.iter().enumerate() {
        let dark = v < threshold;
        match runs.last_mut() {
            Some(run) if run.dark == dark => run.len += 1,
            _ => runs.push(Run { start: i, len: 1, dark }),
        }
    }
    Some(runs)
}

/// Nearest L (or G) digit for four runs, with whether it used the G set
fn match_digit(runs: &[Run], allow_g: bool) -> Option<(u8, bool)> {
    let total: usize = runs.iter().map(|r| r.len).sum();
    if total == 0 {
        return None;
    }
    let norm: Vec<f32> = runs.iter().map(|r| r.len as f32 * 7.0 / total as f32).collect();

    let mut best: Option<(u8, bool, f32)> = None;
    for (digit, widths) in L_WIDTHS.iter().enumerate() {
        let l: f32 = (0..4).map(|k| (norm[k] - widths[k] as f32).abs()).sum();
        if best.map_or(true, |b| l < b.2) {
            best = Some((digit as u8, false, l));
        }
        if allow_g {
            let g: f32 = (0..4).map(|k| (norm[k] - widths[3 - k] as f32).abs()).sum();
            if best.map_or(true, |b| g < b.2) {
                best = Some((digit as u8, true, g));
            }
        }
    }
    best.filter(|b| b.2 <= MAX_DIGIT_DISTANCE)
        .map(|(digit, is_g, _)| (digit, is_g))
}

fn is_guard(runs: &[Run], module: f32) -> bool {
    runs.iter().all(|r| {
        let m = r.len as f32 / module;
        (0.5..=1.5).contains(&m)
    })
}

/// Check digit over the payload digits, weights 3,1,3,... from the right
fn checksum_ok(digits: &[u8]) -> bool {
    let Some((check, payload)) = digits.split_last() else {
        return false;
    };
    let sum: u32 = payload
        .iter()
        .rev()
        .enumerate()
        .map(|(i, &d)| d as u32 * if i % 2 == 0 { 3 } else { 1 })
        .sum();
    (10 - sum % 10) % 10 == *check as u32
}

/// Decode the first valid symbol on a line: text plus its pixel span
fn decode_line(runs: &[Run], symbology: Symbology) -> Option<(String, usize, usize)> {
    let need = symbology.run_count();
    let side = symbology.side_digits();
    if runs.len() < need {
        return None;
    }

    for i in 0..=runs.len() - need {
        if !runs[i].dark {
            continue;
        }
        let window = &runs[i..i + need];
        let start = window[0].start;
        let end = window[need - 1].start + window[need - 1].len;
        let module = (end - start) as f32 / symbology.module_count();
        if module < 1.0 {
            continue;
        }

        if i > 0 && (runs[i - 1].len as f32) < QUIET_ZONE * module {
            continue;
        }
        if i + need < runs.len() && (runs[i + need].len as f32) < QUIET_ZONE * module {
            continue;
        }

        let center = 3 + 4 * side;
        if !is_guard(&window[..3], module)
            || !is_guard(&window[center..center + 5], module)
            || !is_guard(&window[need - 3..], module)
        {
            continue;
        }

        if let Some(text) = read_digits(window, symbology) {
            return Some((text, start, end));
        }
    }
    None
}

fn read_digits(window: &[Run], symbology: Symbology) -> Option<String> {
    let side = symbology.side_digits();
    let allow_g = symbology == Symbology::Ean13;
    let mut digits = Vec::with_capacity(2 * side + 1);
    let mut parity = String::with_capacity(side);

    for d in 0..side {
        let (digit, is_g) = match_digit(&window[3 + 4 * d..7 + 4 * d], allow_g)?;
        digits.push(digit);
        parity.push(if is_g { 'G' } else { 'L' });
    }
    let right = 3 + 4 * side + 5;
    for d in 0..side {
        let (digit, _) = match_digit(&window[right + 4 * d..right + 4 + 4 * d], false)?;
        digits.push(digit);
    }

    if symbology == Symbology::Ean13 {
        let first = FIRST_DIGIT_PARITY.iter().position(|p| *p == parity)?;
        digits.insert(0, first as u8);
    }
    if !checksum_ok(&digits) {
        return None;
    }
    Some(digits.iter().map(|d| char::from(b'0' + d)).collect())
}

fn scan(image: &GrayImage, symbology: Symbology) -> Option<DecodedBarcode> {
    let mut votes: HashMap<String, Vec<Point>> = HashMap::new();
    for line in scanlines(image) {
        let Some(runs) = binarize(&line.values) else {
            continue;
        };
        if let Some((text, start, end)) = decode_line(&runs, symbology) {
            let points = votes.entry(text).or_default();
            points.push(line.point(start as f32));
            points.push(line.point(end as f32 - 1.0));
        }
    }

    let top = votes.values().map(Vec::len).max()?;
    let mut winners = votes.into_iter().filter(|(_, points)| points.len() == top);
    let (text, points) = winners.next()?;
    if winners.next().is_some() {
        // Two readings with equal support.
        return None;
    }

    let (mut x0, mut y0, mut x1, mut y1) = (f32::MAX, f32::MAX, f32::MIN, f32::MIN);
    for p in &points {
        x0 = x0.min(p.x);
        y0 = y0.min(p.y);
        x1 = x1.max(p.x);
        y1 = y1.max(p.y);
    }

    Some(DecodedBarcode {
        data: text.into_bytes(),
        corners: Some([
            Point::new(x0, y0),
            Point::new(x1, y0),
            Point::new(x1, y1),
            Point::new(x0, y1),
        ]),
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::Luma;

    fn push_widths(out: &mut Vec<bool>, widths: [u8; 4], first_dark: bool) {
        let mut dark = first_dark;
        for w in widths {
            out.extend(std::iter::repeat(dark).take(w as usize));
            dark = !dark;
        }
    }

    /// Module pattern of an EAN-13 or EAN-8 number, check digit included as given
    fn modules(digits: &str) -> Vec<bool> {
        let d: Vec<usize> = digits.bytes().map(|b| (b - b'0') as usize).collect();
        let (left, right, parity) = if d.len() == 13 {
            (&d[1..7], &d[7..], FIRST_DIGIT_PARITY[d[0]])
        } else {
            (&d[..4], &d[4..], "LLLL")
        };

        let mut out = vec![true, false, true];
        for (&digit, p) in left.iter().zip(parity.bytes()) {
            let mut widths = L_WIDTHS[digit];
            if p == b'G' {
                widths.reverse();
            }
            push_widths(&mut out, widths, false);
        }
        out.extend([false, true, false, true, false]);
        for &digit in right {
            push_widths(&mut out, L_WIDTHS[digit], true);
        }
        out.extend([true, false, true]);
        out
    }

    /// Barcode with 3px modules centered on a white 640x480 canvas
    pub(crate) fn render(digits: &str) -> GrayImage {
        let bits = modules(digits);
        let x0 = (640 - bits.len() as u32 * 3) / 2;
        GrayImage::from_fn(640, 480, |x, y| {
            let inside = (160..320).contains(&y) && x >= x0 && ((x - x0) / 3) < bits.len() as u32;
            if inside && bits[((x - x0) / 3) as usize] {
                Luma([0])
            } else {
                Luma([255])
            }
        })
    }

    #[test]
    fn test_pattern_lengths() {
        assert_eq!(modules("4006381333931").len(), 95);
        assert_eq!(modules("96385074").len(), 67);
    }

    #[test]
    fn test_checksum() {
        let digits = |s: &str| s.bytes().map(|b| b - b'0').collect::<Vec<_>>();
        assert!(checksum_ok(&digits("4006381333931")));
        assert!(checksum_ok(&digits("96385074")));
        assert!(!checksum_ok(&digits("4006381333932")));
    }

    #[test]
    fn test_decode_ean13() {
        let decoded = Ean13Decoder.decode(&render("4006381333931")).unwrap();
        assert_eq!(decoded.data, b"4006381333931");

        let corners = decoded.corners.unwrap();
        assert!((corners[0].x - 177.0).abs() < 2.0);
        assert!((corners[1].x - 461.0).abs() < 2.0);
        assert!(corners[0].y >= 160.0 && corners[3].y < 320.0);
    }

    #[test]
    fn test_decode_ean8() {
        let decoded = Ean8Decoder.decode(&render("96385074")).unwrap();
        assert_eq!(decoded.data, b"96385074");
    }

    #[test]
    fn test_formats_do_not_cross() {
        assert!(Ean8Decoder.decode(&render("4006381333931")).is_none());
        assert!(Ean13Decoder.decode(&render("96385074")).is_none());
    }

    #[test]
    fn test_decode_rotated() {
        let code = render("4006381333931");
        let upside_down = image::imageops::rotate180(&code);
        assert_eq!(Ean13Decoder.decode(&upside_down).unwrap().data, b"4006381333931");

        let sideways = image::imageops::rotate90(&code);
        assert_eq!(Ean13Decoder.decode(&sideways).unwrap().data, b"4006381333931");
    }

    #[test]
    fn test_bad_check_digit_rejected() {
        assert!(Ean13Decoder.decode(&render("4006381333932")).is_none());
    }

    #[test]
    fn test_blank_image() {
        let blank = GrayImage::from_pixel(640, 480, Luma([200]));
        assert!(Ean13Decoder.decode(&blank).is_none());
        assert!(Ean8Decoder.decode(&blank).is_none());
    }
}
