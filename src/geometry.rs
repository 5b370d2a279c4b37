//! Envelope geometry derived from bounding-box text.
//!
//! Resources carry their extent as `ENVELOPE(w,e,n,s)` text. The parsed
//! envelope is cached in four columns of the scalar table and is the only
//! geometry the spatial predicates and the relevance score look at.
//!
//! Envelopes are planar and never wrap: text whose west edge is east of its
//! east edge (an extent crossing the antimeridian) is treated as malformed,
//! so such a resource has no geometry and never matches a spatial search.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Axis-aligned bounding box in lon/lat degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Envelope {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    /// Parse `ENVELOPE(w,e,n,s)` text.
    ///
    /// Returns `None` for anything else, including envelopes whose west edge
    /// lies east of the east edge or whose south edge lies north of the north
    /// edge.
    pub fn parse(text: &str) -> Option<Self> {
        let caps = envelope_pattern().captures(text)?;
        let mut coords = [0.0f64; 4];
        for (slot, idx) in coords.iter_mut().zip(1..=4) {
            let value: f64 = caps.get(idx)?.as_str().parse().ok()?;
            if !value.is_finite() {
                return None;
            }
            *slot = value;
        }
        let [west, east, north, south] = coords;
        if west > east || south > north {
            return None;
        }
        Some(Self::new(west, south, east, north))
    }

    /// Render back to `ENVELOPE(w,e,n,s)` form.
    pub fn to_envelope_text(&self) -> String {
        format!(
            "ENVELOPE({},{},{},{})",
            self.min_x, self.max_x, self.max_y, self.min_y
        )
    }

    pub fn area(&self) -> f64 {
        (self.max_x - self.min_x).max(0.0) * (self.max_y - self.min_y).max(0.0)
    }

    /// Check if this envelope intersects another (touching edges count).
    pub fn intersects(&self, other: &Envelope) -> bool {
        self.min_x <= other.max_x
            && self.max_x >= other.min_x
            && self.min_y <= other.max_y
            && self.max_y >= other.min_y
    }

    /// Overlapping region, if any.
    pub fn intersection(&self, other: &Envelope) -> Option<Envelope> {
        if !self.intersects(other) {
            return None;
        }
        Some(Envelope::new(
            self.min_x.max(other.min_x),
            self.min_y.max(other.min_y),
            self.max_x.min(other.max_x),
            self.max_y.min(other.max_y),
        ))
    }

    /// Intersection over union, in `[0, 1]`.
    pub fn iou(&self, other: &Envelope) -> f64 {
        let inter = match self.intersection(other) {
            Some(env) => env.area(),
            None => return 0.0,
        };
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            return 0.0;
        }
        (inter / union).clamp(0.0, 1.0)
    }
}

fn envelope_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        let num = r"\s*([-+]?(?:\d+(?:\.\d*)?|\.\d+)(?:[eE][-+]?\d+)?)\s*";
        Regex::new(&format!(r"(?i)^\s*ENVELOPE\s*\({num},{num},{num},{num}\)\s*$"))
            .expect("envelope pattern is a valid regex")
    })
}

/// IoU over raw column values, as evaluated by the `bbox_iou` SQL function.
///
/// Any missing coordinate yields `None` so rows without geometry sort as
/// non-matches.
pub fn iou_from_parts(resource: [Option<f64>; 4], query: [Option<f64>; 4]) -> Option<f64> {
    let [a, b, c, d] = resource;
    let [e, f, g, h] = query;
    let resource = Envelope::new(a?, b?, c?, d?);
    let query = Envelope::new(e?, f?, g?, h?);
    Some(resource.iou(&query))
}
