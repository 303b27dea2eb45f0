//! Plot data: how far sequences stray from a straight line in representation space.

use burn_core as burn;

use burn::tensor::backend::AutodiffBackend;
use burn::tensor::Tensor;

use crate::geodesic::Geodesic;
use crate::model::AnalysisModel;
use crate::straightness::deviation_from_line_or_nan;
use crate::{Error, Result};

/// Normalized (along, from) distances per frame.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviationCurve {
    pub along: Vec<f64>,
    pub from: Vec<f64>,
}

/// Deviation curves of the pixelfade, the current geodesic and, optionally, a natural video, all
/// measured in the engine's representation space and normalized by each sequence's chord. A
/// sequence whose end frames map to the same representation gets NaN curves.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviationCurves {
    pub pixelfade: DeviationCurve,
    pub geodesic: DeviationCurve,
    pub natural_video: Option<DeviationCurve>,
}

fn curve<B: AutodiffBackend, M: AnalysisModel<B>>(
    engine: &Geodesic<B, M>,
    sequence: Tensor<B, 4>,
) -> Result<DeviationCurve> {
    let representation = engine.model().forward(sequence).inner();
    let (along, from) = deviation_from_line_or_nan(representation, true)?;
    Ok(DeviationCurve { along, from })
}

/// Compute the curves a deviation plot draws.
///
/// `natural_video` must have `n_steps + 1` frames of the anchors' shape.
pub fn deviation_curves<B: AutodiffBackend, M: AnalysisModel<B>>(
    engine: &Geodesic<B, M>,
    natural_video: Option<Tensor<B, 4>>,
) -> Result<DeviationCurves> {
    let natural_video = match natural_video {
        None => None,
        Some(video) => {
            let expected = engine.geodesic().dims();
            if video.dims() != expected {
                return Err(Error::Shape(format!(
                    "natural_video must be {expected:?}, but got {:?}",
                    video.dims()
                )));
            }
            Some(curve(engine, video.detach())?)
        }
    };
    Ok(DeviationCurves {
        pixelfade: curve(engine, engine.pixelfade())?,
        geodesic: curve(engine, engine.geodesic())?,
        natural_video,
    })
}
