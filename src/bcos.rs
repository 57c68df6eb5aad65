use ndarray::{Array1, Array4, CowArray, Ix2, Ix4};
use ort::session::Session;

use crate::error::ModelError;
use crate::model::extract_f32_outputs;
use crate::provider::{Explainer, PatchClassifier};
use crate::saliency::DifferentiableInput;

/// B-cos ResNet patch classifier. Input `[1, 6, 256, 256]`, output logits `[1, classes]`.
pub struct BcosClassifier {
    session: Session,
}

impl BcosClassifier {
    pub fn new(session: Session) -> Self {
        Self { session }
    }
}

impl PatchClassifier for BcosClassifier {
    fn logits(&self, input: &Array4<f32>) -> Result<Array1<f32>, ModelError> {
        let xs = CowArray::from(input.view().into_dyn());
        let ys = self.session.run(ort::inputs![xs.view()]?)?;
        let outputs = extract_f32_outputs(&ys)?;
        let logits = outputs[0].view().into_dimensionality::<Ix2>()?;
        if logits.nrows() != 1 || logits.ncols() == 0 {
            return Err(ModelError::output(format!(
                "classifier returned logits of shape {:?}",
                logits.shape()
            )));
        }
        Ok(logits.row(0).to_owned())
    }
}

/// Explanation graph exported next to the classifier: takes the six-channel
/// input and the target class index, returns the contribution map `[1, 6, H, W]`.
pub struct BcosExplainer {
    session: Session,
}

impl BcosExplainer {
    pub fn new(session: Session) -> Self {
        Self { session }
    }
}

impl Explainer for BcosExplainer {
    fn explain(&self, input: &DifferentiableInput, target_class: usize) -> Result<Array4<f32>, ModelError> {
        let xs = CowArray::from(input.tensor().view().into_dyn());
        let target = CowArray::from(Array1::from_elem(1, target_class as i64).into_dyn());
        let ys = self.session.run(ort::inputs![xs.view(), target.view()]?)?;
        let mut outputs = extract_f32_outputs(&ys)?;
        Ok(outputs.swap_remove(0).into_dimensionality::<Ix4>()?)
    }
}
