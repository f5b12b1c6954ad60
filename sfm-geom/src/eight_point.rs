use crate::EssentialMatrix;
use arrayvec::ArrayVec;
use sfm_core::{
    nalgebra::{Matrix3, OMatrix, OVector, U9},
    sample_consensus::Estimator,
    CameraToCamera, FeatureMatch, NormalizedKeyPoint,
};

/// Performs the
/// [eight-point algorithm](https://en.wikipedia.org/wiki/Eight-point_algorithm)
/// by Richard Hartley and Andrew Zisserman on normalized keypoints.
///
/// More than eight matches may be supplied, in which case the least squares essential matrix is
/// found. The result is reconditioned before it is decomposed.
#[derive(Copy, Clone, Debug)]
pub struct EightPoint {
    pub epsilon: f64,
    pub iterations: usize,
}

impl EightPoint {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn from_matches<I>(&self, data: I) -> Option<EssentialMatrix>
    where
        I: Iterator<Item = FeatureMatch<NormalizedKeyPoint>>,
    {
        // Normal equations of the epipolar constraint `x2ᵀ E x1 = 0` over the column major `E`.
        let mut normal = OMatrix::<f64, U9, U9>::zeros();
        let mut count = 0;
        for FeatureMatch(a, b) in data {
            let x1 = a.virtual_image_point();
            let x2 = b.virtual_image_point();
            let mut row = OVector::<f64, U9>::zeros();
            for j in 0..3 {
                row.fixed_rows_mut::<3>(3 * j).copy_from(&(x1[j] * x2));
            }
            normal += row * row.transpose();
            count += 1;
        }
        if count < 8 {
            return None;
        }
        let eigens = normal.try_symmetric_eigen(self.epsilon, self.iterations)?;
        let eigenvector = eigens
            .eigenvalues
            .iter()
            .enumerate()
            .min_by_key(|&(_, &n)| float_ord::FloatOrd(n))
            .map(|(ix, _)| eigens.eigenvectors.column(ix).into_owned())?;
        EssentialMatrix(Matrix3::from_iterator(eigenvector.iter().copied()))
            .recondition(self.epsilon, self.iterations)
    }
}

impl Default for EightPoint {
    fn default() -> Self {
        Self {
            epsilon: 1e-12,
            iterations: 1000,
        }
    }
}

impl Estimator<FeatureMatch<NormalizedKeyPoint>> for EightPoint {
    type Model = CameraToCamera;
    type ModelIter = ArrayVec<CameraToCamera, 4>;
    const MIN_SAMPLES: usize = 8;

    fn estimate<I>(&self, data: I) -> Self::ModelIter
    where
        I: Iterator<Item = FeatureMatch<NormalizedKeyPoint>> + Clone,
    {
        self.from_matches(data)
            .and_then(|essential| essential.possible_unscaled_poses(self.epsilon, self.iterations))
            .map(ArrayVec::from)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use sfm_core::{
        nalgebra::{Point3, Rotation3, Vector3},
        sample_consensus::Model,
        Pose,
    };

    #[test]
    fn recovers_essential_matrix_from_exact_matches() {
        let pose = CameraToCamera::from_parts(
            Vector3::new(0.6, -0.2, 0.1),
            Rotation3::from_euler_angles(0.1, -0.05, 0.2),
        );
        let matches: Vec<_> = (0..12)
            .map(|i| {
                let point = Point3::new(
                    (i % 4) as f64 * 0.5 - 0.75,
                    (i / 4) as f64 * 0.4 - 0.4,
                    3.0 + (i % 5) as f64 * 0.7,
                );
                let a = NormalizedKeyPoint((point.xy().coords / point.z).into());
                let pb = pose.0.transform_point(&point);
                let b = NormalizedKeyPoint((pb.xy().coords / pb.z).into());
                FeatureMatch(a, b)
            })
            .collect();
        let candidates = EightPoint::new().estimate(matches.iter().copied());
        assert_eq!(candidates.len(), 4);
        for candidate in &candidates {
            for m in &matches {
                assert!(candidate.residual(m) < 1e-9);
            }
        }
    }
}
