//! Reference matching by normalized cross-correlation
//!
//! The query is resampled into a small pyramid, one level per scale, where a
//! level's longest side is `DESCRIPTOR_SIZE / scale`. Each reference thumbnail
//! is slid over every level with zero-mean NCC, using integral images for the
//! window statistics. A coarse stride-2 pass is refined around its best hit.
//! Halves of the reference are searched the same way for partial matches.

use image::{imageops::FilterType, GrayImage};
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use crate::config::MatchingSettings;
use crate::flags::SearchOptions;
use crate::result::{Geometry, Point};
use crate::storage::signature::{SignatureRecord, DESCRIPTOR_SIZE};

/// Reference longest side relative to the query longest side
const DEFAULT_SCALES: [f32; 8] = [1.0, 0.88, 0.77, 0.68, 0.6, 0.53, 0.46, 0.4];
const SMALL_TARGET_SCALES: [f32; 4] = [0.35, 0.31, 0.27, 0.24];

/// Summed-area tables of a level
struct Integral {
    stride: usize,
    sum: Vec<f64>,
    sq: Vec<f64>,
}

impl Integral {
    fn new(image: &GrayImage) -> Self {
        let (w, h) = (image.width() as usize, image.height() as usize);
        let stride = w + 1;
        let mut sum = vec![0.0; stride * (h + 1)];
        let mut sq = vec![0.0; stride * (h + 1)];
        let raw = image.as_raw();

        for y in 0..h {
            let mut row_sum = 0.0;
            let mut row_sq = 0.0;
            for x in 0..w {
                let v = raw[y * w + x] as f64;
                row_sum += v;
                row_sq += v * v;
                sum[(y + 1) * stride + x + 1] = sum[y * stride + x + 1] + row_sum;
                sq[(y + 1) * stride + x + 1] = sq[y * stride + x + 1] + row_sq;
            }
        }
        Self { stride, sum, sq }
    }

    /// Sum and sum of squares over a window
    fn window(&self, x: usize, y: usize, w: usize, h: usize) -> (f64, f64) {
        let s = self.stride;
        let (a, b, c, d) = (y * s + x, y * s + x + w, (y + h) * s + x, (y + h) * s + x + w);
        (
            self.sum[d] - self.sum[b] - self.sum[c] + self.sum[a],
            self.sq[d] - self.sq[b] - self.sq[c] + self.sq[a],
        )
    }
}

/// One resampled copy of the query
struct Level {
    image: GrayImage,
    integral: Integral,
    /// Query pixels per level pixel, horizontally and vertically
    fx: f32,
    fy: f32,
}

/// Query resampled at every searched scale
pub(crate) struct Pyramid {
    levels: Vec<Level>,
    query_size: (u32, u32),
}

impl Pyramid {
    pub(crate) fn new(query: &GrayImage, options: SearchOptions) -> Self {
        let (qw, qh) = query.dimensions();
        let longest = qw.max(qh) as f32;

        let mut scales: Vec<f32> = DEFAULT_SCALES.to_vec();
        if options.contains(SearchOptions::SMALL_TARGET) {
            scales.extend_from_slice(&SMALL_TARGET_SCALES);
        }

        let levels = scales
            .into_iter()
            .filter_map(|scale| {
                let target = (DESCRIPTOR_SIZE as f32 / scale).min(longest);
                let ratio = target / longest;
                let lw = ((qw as f32 * ratio).round() as u32).max(1);
                let lh = ((qh as f32 * ratio).round() as u32).max(1);
                if lw < 4 || lh < 4 {
                    return None;
                }
                let image = image::imageops::resize(query, lw, lh, FilterType::Triangle);
                let integral = Integral::new(&image);
                Some(Level {
                    image,
                    integral,
                    fx: qw as f32 / lw as f32,
                    fy: qh as f32 / lh as f32,
                })
            })
            .collect();

        Self {
            levels,
            query_size: (qw, qh),
        }
    }
}

/// Zero-mean template cut from a reference thumbnail
struct Template {
    /// Offset of the cut inside the full thumbnail
    ox: usize,
    oy: usize,
    w: usize,
    h: usize,
    values: Vec<f64>,
    norm: f64,
}

impl Template {
    fn cut(image: &GrayImage, ox: usize, oy: usize, w: usize, h: usize) -> Option<Self> {
        if w < 4 || h < 4 {
            return None;
        }
        let iw = image.width() as usize;
        let raw = image.as_raw();
        let n = (w * h) as f64;

        let mut values = Vec::with_capacity(w * h);
        for y in oy..oy + h {
            values.extend(raw[y * iw + ox..y * iw + ox + w].iter().map(|&v| v as f64));
        }
        let mean = values.iter().sum::<f64>() / n;
        for v in values.iter_mut() {
            *v -= mean;
        }
        let norm = values.iter().map(|v| v * v).sum::<f64>().sqrt();
        // Flat templates carry no information.
        if norm < 1e-3 * n.sqrt() {
            return None;
        }
        Some(Self { ox, oy, w, h, values, norm })
    }

    fn full(image: &GrayImage) -> Option<Self> {
        Self::cut(image, 0, 0, image.width() as usize, image.height() as usize)
    }

    /// Left, right, top and bottom halves
    fn halves(image: &GrayImage) -> Vec<Self> {
        let (w, h) = (image.width() as usize, image.height() as usize);
        let (hw, hh) = (w / 2, h / 2);
        [
            Self::cut(image, 0, 0, hw, h),
            Self::cut(image, hw, 0, w - hw, h),
            Self::cut(image, 0, 0, w, hh),
            Self::cut(image, 0, hh, w, h - hh),
        ]
        .into_iter()
        .flatten()
        .collect()
    }

    /// NCC score of the template placed at (x, y) in the level
    fn score_at(&self, level: &Level, x: usize, y: usize) -> f32 {
        let n = (self.w * self.h) as f64;
        let (sum, sq) = level.integral.window(x, y, self.w, self.h);
        let var = sq - sum * sum / n;
        if var <= 1e-6 {
            return 0.0;
        }

        let lw = level.image.width() as usize;
        let raw = level.image.as_raw();
        let mut num = 0.0;
        for j in 0..self.h {
            let row = &raw[(y + j) * lw + x..(y + j) * lw + x + self.w];
            let tpl = &self.values[j * self.w..(j + 1) * self.w];
            num += row.iter().zip(tpl).map(|(&p, &t)| p as f64 * t).sum::<f64>();
        }
        (num / (var.sqrt() * self.norm)) as f32
    }

    /// Best placement in a level: coarse stride-2 scan, then local refinement
    fn best_in(&self, level: &Level) -> Option<(usize, usize, f32)> {
        let (lw, lh) = (level.image.width() as usize, level.image.height() as usize);
        if self.w > lw || self.h > lh {
            return None;
        }
        let (max_x, max_y) = (lw - self.w, lh - self.h);

        let mut best = (0, 0, f32::MIN);
        for y in (0..=max_y).step_by(2) {
            for x in (0..=max_x).step_by(2) {
                let s = self.score_at(level, x, y);
                if s > best.2 {
                    best = (x, y, s);
                }
            }
        }

        let (cx, cy, _) = best;
        for y in cy.saturating_sub(1)..=(cy + 1).min(max_y) {
            for x in cx.saturating_sub(1)..=(cx + 1).min(max_x) {
                let s = self.score_at(level, x, y);
                if s > best.2 {
                    best = (x, y, s);
                }
            }
        }
        Some(best)
    }
}

/// Best placement of a template over the whole pyramid
#[derive(Debug, Clone, Copy)]
struct Placement {
    level: usize,
    /// Top-left of the full reference in level pixels (may be negative for halves)
    x: f32,
    y: f32,
    score: f32,
}

fn search(pyramid: &Pyramid, template: &Template) -> Option<Placement> {
    let mut best: Option<Placement> = None;
    for (i, level) in pyramid.levels.iter().enumerate() {
        if let Some((x, y, score)) = template.best_in(level) {
            if best.map_or(true, |b| score > b.score) {
                best = Some(Placement {
                    level: i,
                    x: x as f32 - template.ox as f32,
                    y: y as f32 - template.oy as f32,
                    score,
                });
            }
        }
    }
    best
}

/// An accepted reference
#[derive(Debug, Clone)]
pub(crate) struct Candidate {
    pub record: Arc<SignatureRecord>,
    pub score: f32,
    pub partial: bool,
    placement: Placement,
}

impl Candidate {
    /// Full match outranks partial, then higher score, then smaller identifier
    fn rank(&self, other: &Candidate) -> Ordering {
        other
            .partial
            .cmp(&self.partial)
            .then(self.score.partial_cmp(&other.score).unwrap_or(Ordering::Equal))
            .then_with(|| other.record.id.cmp(&self.record.id))
    }

    /// Corners, homography and dimensions of the placement in query coordinates
    pub(crate) fn geometry(&self, pyramid: &Pyramid) -> Geometry {
        let level = &pyramid.levels[self.placement.level];
        let (qw, qh) = (pyramid.query_size.0 as f32, pyramid.query_size.1 as f32);
        let descriptor = &self.record.descriptor;

        let x0 = self.placement.x * level.fx;
        let y0 = self.placement.y * level.fy;
        let w = descriptor.width() as f32 * level.fx;
        let h = descriptor.height() as f32 * level.fy;

        let a = w / qw;
        let b = (2.0 * x0 + w) / qw - 1.0;
        let c = h / qh;
        let d = (2.0 * y0 + h) / qh - 1.0;

        Geometry {
            corners: Some([
                Point::new(x0, y0),
                Point::new(x0 + w, y0),
                Point::new(x0 + w, y0 + h),
                Point::new(x0, y0 + h),
            ]),
            homography: Some([a, 0.0, b, 0.0, c, d, 0.0, 0.0, 1.0]),
            dimensions: Some((self.record.width, self.record.height)),
        }
    }
}

/// Score one reference against the pyramid
fn evaluate(
    pyramid: &Pyramid,
    record: &Arc<SignatureRecord>,
    options: SearchOptions,
    settings: &MatchingSettings,
) -> Option<Candidate> {
    let thumb = record.descriptor.to_gray_image();
    let full = Template::full(&thumb)?;
    let placement = search(pyramid, &full)?;
    if placement.score >= settings.acceptance_threshold {
        return Some(Candidate {
            record: record.clone(),
            score: placement.score,
            partial: false,
            placement,
        });
    }
    if options.contains(SearchOptions::NO_PARTIAL) {
        return None;
    }

    Template::halves(&thumb)
        .iter()
        .filter_map(|half| search(pyramid, half))
        .filter(|p| p.score >= settings.partial_threshold)
        .max_by(|a, b| a.score.partial_cmp(&b.score).unwrap_or(Ordering::Equal))
        .map(|placement| Candidate {
            record: record.clone(),
            score: placement.score,
            partial: true,
            placement,
        })
}

/// Pick the winning reference, if any
pub(crate) fn find_best(
    pyramid: &Pyramid,
    references: &[Arc<SignatureRecord>],
    options: SearchOptions,
    settings: &MatchingSettings,
) -> Option<Candidate> {
    let start = Instant::now();
    let mut candidates: Vec<Candidate> = references
        .iter()
        .filter_map(|record| evaluate(pyramid, record, options, settings))
        .collect();
    candidates.sort_by(|a, b| b.rank(a));

    let winner = candidates.first()?.clone();
    if winner.partial {
        let rivals = candidates
            .iter()
            .filter(|c| c.partial && winner.score - c.score <= settings.ambiguity_margin)
            .count();
        if rivals > 1 {
            debug!(
                "Rejected ambiguous partial match {} ({} rivals within {})",
                winner.record.id, rivals, settings.ambiguity_margin
            );
            return None;
        }
    }

    debug!(
        "Matched {} (score {:.3}, partial {}) among {} references in {:?}",
        winner.record.id,
        winner.score,
        winner.partial,
        references.len(),
        start.elapsed()
    );
    Some(winner)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{DynamicImage, Luma};

    /// Smooth random field, distinct per seed
    pub(crate) fn texture(seed: u64, w: u32, h: u32) -> GrayImage {
        let mut state = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1;
        let blocks = GrayImage::from_fn(w.div_ceil(24), h.div_ceil(24), |_, _| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            Luma([(state % 256) as u8])
        });
        let up = image::imageops::resize(&blocks, w, h, FilterType::Nearest);
        image::imageops::blur(&up, 6.0)
    }

    /// Where a 160x120 reference lands when pasted by [`compose`]
    pub(crate) const PASTE_SIZE: (u32, u32) = (384, 288);
    pub(crate) const PASTE_AT: (i64, i64) = (128, 96);

    /// Paste `reference` scaled to `size` at (x, y) on a flat query
    pub(crate) fn compose(reference: &GrayImage, size: (u32, u32), at: (i64, i64)) -> GrayImage {
        let mut query = GrayImage::from_pixel(640, 480, Luma([120]));
        let scaled = image::imageops::resize(reference, size.0, size.1, FilterType::Triangle);
        image::imageops::overlay(&mut query, &scaled, at.0, at.1);
        query
    }

    pub(crate) fn record(id: &str, image: &GrayImage) -> Arc<SignatureRecord> {
        Arc::new(SignatureRecord::from_image(id, 1, &DynamicImage::ImageLuma8(image.clone())).unwrap())
    }

    #[test]
    fn test_integral_window() {
        let img = GrayImage::from_fn(5, 4, |x, y| Luma([(x + y * 5) as u8]));
        let integral = Integral::new(&img);
        let (sum, sq) = integral.window(1, 1, 2, 2);
        // pixels 6, 7, 11, 12
        assert_eq!(sum, 36.0);
        assert_eq!(sq, 36.0 + 49.0 + 121.0 + 144.0);
    }

    #[test]
    fn test_template_matches_itself() {
        let img = GrayImage::from_fn(64, 48, |x, y| Luma([((x * 37 + y * 91 + x * y * 13) % 251) as u8]));
        let tpl = Template::cut(&img, 8, 8, 24, 16).unwrap();
        let level = Level {
            integral: Integral::new(&img),
            image: img,
            fx: 1.0,
            fy: 1.0,
        };
        let (x, y, score) = tpl.best_in(&level).unwrap();
        assert_eq!((x, y), (8, 8));
        assert!(score > 0.999);
    }

    #[test]
    fn test_flat_template_rejected() {
        let flat = GrayImage::from_pixel(32, 24, Luma([90]));
        assert!(Template::full(&flat).is_none());
    }

    #[test]
    fn test_finds_embedded_reference() {
        let cover = texture(1, 160, 120);
        let other = texture(2, 160, 120);
        let refs = vec![record("cover", &cover), record("other", &other)];

        let query = compose(&cover, PASTE_SIZE, PASTE_AT);
        let pyramid = Pyramid::new(&query, SearchOptions::DEFAULT);
        let best = find_best(&pyramid, &refs, SearchOptions::DEFAULT, &MatchingSettings::default()).unwrap();

        assert_eq!(best.record.id, "cover");
        assert!(!best.partial);

        let corners = best.geometry(&pyramid).corners.unwrap();
        assert!((corners[0].x - 128.0).abs() < 20.0);
        assert!((corners[2].x - 512.0).abs() < 30.0);
    }

    #[test]
    fn test_unrelated_query_has_no_match() {
        let refs = vec![record("a", &texture(10, 160, 120)), record("b", &texture(11, 160, 120))];
        let query = compose(&texture(12, 160, 120), PASTE_SIZE, PASTE_AT);
        let pyramid = Pyramid::new(&query, SearchOptions::DEFAULT);
        assert!(find_best(&pyramid, &refs, SearchOptions::DEFAULT, &MatchingSettings::default()).is_none());
    }

    #[test]
    fn test_small_target_widens_scales() {
        let query = GrayImage::new(640, 480);
        let default = Pyramid::new(&query, SearchOptions::DEFAULT);
        let small = Pyramid::new(&query, SearchOptions::SMALL_TARGET);
        assert_eq!(default.levels.len(), DEFAULT_SCALES.len());
        assert_eq!(small.levels.len(), DEFAULT_SCALES.len() + SMALL_TARGET_SCALES.len());
    }

    /// Left 55% of `left` joined with the rest of `right`
    pub(crate) fn splice(left: &GrayImage, right: &GrayImage) -> GrayImage {
        let seam = left.width() * 11 / 20;
        GrayImage::from_fn(left.width(), left.height(), |x, y| {
            if x < seam {
                *left.get_pixel(x, y)
            } else {
                *right.get_pixel(x, y)
            }
        })
    }

    #[test]
    fn test_partial_match_and_no_partial_option() {
        let cover = texture(21, 160, 120);
        let refs = vec![record("cover", &cover)];
        let occluded = splice(&cover, &texture(22, 160, 120));
        let query = compose(&occluded, PASTE_SIZE, PASTE_AT);
        let pyramid = Pyramid::new(&query, SearchOptions::DEFAULT);
        let settings = MatchingSettings::default();

        let best = find_best(&pyramid, &refs, SearchOptions::DEFAULT, &settings).unwrap();
        assert_eq!(best.record.id, "cover");
        assert!(best.partial);

        assert!(find_best(&pyramid, &refs, SearchOptions::NO_PARTIAL, &settings).is_none());
    }

    #[test]
    fn test_shared_half_is_ambiguous() {
        let logo = texture(31, 160, 120);
        let first = splice(&logo, &texture(32, 160, 120));
        let second = splice(&logo, &texture(33, 160, 120));
        let refs = vec![record("first", &first), record("second", &second)];
        let settings = MatchingSettings::default();

        // Only the shared half is visible: both are partial candidates.
        let query = compose(&splice(&logo, &texture(34, 160, 120)), PASTE_SIZE, PASTE_AT);
        let pyramid = Pyramid::new(&query, SearchOptions::DEFAULT);
        assert!(find_best(&pyramid, &refs, SearchOptions::DEFAULT, &settings).is_none());

        // The whole first reference is visible: the full match wins.
        let query = compose(&first, PASTE_SIZE, PASTE_AT);
        let pyramid = Pyramid::new(&query, SearchOptions::DEFAULT);
        let best = find_best(&pyramid, &refs, SearchOptions::DEFAULT, &settings).unwrap();
        assert_eq!(best.record.id, "first");
        assert!(!best.partial);
    }

    #[test]
    fn test_rank_orders_full_then_score_then_id() {
        let img = texture(40, 64, 48);
        let placement = Placement { level: 0, x: 0.0, y: 0.0, score: 0.0 };
        let make = |id: &str, score: f32, partial: bool| Candidate {
            record: record(id, &img),
            score,
            partial,
            placement,
        };
        let mut list = vec![
            make("b", 0.95, true),
            make("c", 0.85, false),
            make("b", 0.90, false),
            make("a", 0.90, false),
        ];
        list.sort_by(|a, b| b.rank(a));
        let order: Vec<(&str, bool)> = list.iter().map(|c| (c.record.id.as_str(), c.partial)).collect();
        assert_eq!(order, vec![("a", false), ("b", false), ("c", false), ("b", true)]);
    }
}
