//! Subjective rating helpers.
//!
//! Ratings are integers on a 1–10 distress scale. The change between the
//! pre- and post-exercise rating is reported to analytics only and never
//! stored on the session.

/// Lowest value on the rating scale
pub const RATING_MIN: i32 = 1;
/// Highest value on the rating scale
pub const RATING_MAX: i32 = 10;

/// Whether `value` sits on the rating scale
pub fn is_on_scale(value: i32) -> bool {
    (RATING_MIN..=RATING_MAX).contains(&value)
}

/// Change between a pre- and post-exercise rating
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RatingChange {
    /// `pre - post`; positive means the user feels better
    pub reduction: i32,
    /// `reduction / pre * 100`, rounded half away from zero
    pub reduction_percentage: i32,
}

impl RatingChange {
    /// Compute the change from an optional pre-rating to a post-rating.
    ///
    /// Without a pre-rating both values are zero. A pre-rating of zero or
    /// below yields the raw reduction with a zero percentage.
    pub fn between(pre: Option<i32>, post: i32) -> Self {
        let Some(pre) = pre else {
            return Self {
                reduction: 0,
                reduction_percentage: 0,
            };
        };

        let reduction = pre - post;
        let reduction_percentage = if pre > 0 {
            (f64::from(reduction) / f64::from(pre) * 100.0).round() as i32
        } else {
            0
        };

        Self {
            reduction,
            reduction_percentage,
        }
    }
}
