use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use std::num::NonZeroU32;
use std::str::FromStr;

pub type DimSize = NonZeroU32;
pub type Shape = Vec<DimSize>;

/// Added to the variance before taking its square root.
pub const EPSILON: f32 = 1e-5;

/// The size of one batch normalization problem.
///
/// Batch is fixed at one, so the normalized tensor has shape
/// `(channels, spatial, spatial)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
pub struct ProblemSize {
    pub channels: DimSize,
    pub spatial: DimSize,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SizeError {
    #[error("invalid size {channels}x{spatial}: both extents must be positive")]
    InvalidSize { channels: i64, spatial: i64 },
    #[error("expected a size like \"32x28\", got {0:?}")]
    Malformed(String),
}

impl ProblemSize {
    pub fn new(channels: i64, spatial: i64) -> Result<Self, SizeError> {
        let invalid = || SizeError::InvalidSize { channels, spatial };
        let to_dim = |v: i64| {
            u32::try_from(v)
                .ok()
                .and_then(DimSize::new)
                .ok_or_else(invalid)
        };
        Ok(ProblemSize {
            channels: to_dim(channels)?,
            spatial: to_dim(spatial)?,
        })
    }

    /// Shape of the data and output tensors.
    pub fn shape(&self) -> Shape {
        vec![self.channels, self.spatial, self.spatial]
    }

    /// Shape of the per-channel statistics (mean, variance, gamma, beta).
    pub fn channel_shape(&self) -> Shape {
        vec![self.channels]
    }

    pub fn volume(&self) -> u64 {
        volume(&self.shape())
    }
}

impl Display for ProblemSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.channels, self.spatial)
    }
}

impl FromStr for ProblemSize {
    type Err = SizeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || SizeError::Malformed(s.to_owned());
        let (c, sp) = s.trim().split_once(['x', 'X']).ok_or_else(malformed)?;
        let c = c.trim().parse::<i64>().map_err(|_| malformed())?;
        let sp = sp.trim().parse::<i64>().map_err(|_| malformed())?;
        ProblemSize::new(c, sp)
    }
}

pub fn volume(shape: &[DimSize]) -> u64 {
    shape.iter().map(|d| u64::from(d.get())).product()
}

/// Row-major strides, in elements.
pub fn row_major_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    strides
}

pub fn shape_to_usize(shape: &[DimSize]) -> Vec<usize> {
    shape.iter().map(|d| d.get() as usize).collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use proptest::prelude::*;

    pub(crate) fn arb_problem_size(
        max_channels: u32,
        max_spatial: u32,
    ) -> impl Strategy<Value = ProblemSize> {
        (1..=max_channels, 1..=max_spatial).prop_map(|(c, s)| ProblemSize {
            channels: DimSize::new(c).unwrap(),
            spatial: DimSize::new(s).unwrap(),
        })
    }

    #[test]
    fn test_new_rejects_non_positive() {
        assert_eq!(
            ProblemSize::new(0, 28),
            Err(SizeError::InvalidSize {
                channels: 0,
                spatial: 28
            })
        );
        assert!(ProblemSize::new(32, -1).is_err());
        assert!(ProblemSize::new(i64::from(u32::MAX) + 1, 1).is_err());
    }

    #[test]
    fn test_parse() {
        let size: ProblemSize = "32x28".parse().unwrap();
        assert_eq!(size, ProblemSize::new(32, 28).unwrap());
        assert_eq!(size.to_string(), "32x28");
        assert_eq!(size.volume(), 25088);
        assert!(matches!(
            "32".parse::<ProblemSize>(),
            Err(SizeError::Malformed(_))
        ));
        assert!(matches!(
            "0x28".parse::<ProblemSize>(),
            Err(SizeError::InvalidSize { .. })
        ));
    }

    #[test]
    fn test_row_major_strides() {
        assert_eq!(row_major_strides(&[32, 28, 28]), vec![784, 28, 1]);
        assert_eq!(row_major_strides(&[5]), vec![1]);
        assert!(row_major_strides(&[]).is_empty());
    }

    proptest! {
        #[test]
        fn test_display_parse_agree(size in arb_problem_size(512, 64)) {
            prop_assert_eq!(size.to_string().parse::<ProblemSize>().unwrap(), size);
        }
    }
}
