/// A match between a feature in image `A` (`.0`) and a feature in image `B` (`.1`).
///
/// For sparse feature matches `P` is the keypoint index in each feature set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(
    feature = "serde-serialize",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct FeatureMatch<P>(pub P, pub P);

impl<P> FeatureMatch<P> {
    /// Swaps the roles of image `A` and image `B`.
    #[must_use]
    pub fn swap(self) -> Self {
        Self(self.1, self.0)
    }
}
