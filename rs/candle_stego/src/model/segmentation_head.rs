//! STEGO Segmentation Head
//!
//! Projects frozen backbone features to the low-dimensional code space the
//! correlation loss trains: a linear 1x1 branch plus a two-layer 1x1 branch.

use candle_core::{Module, Result, Tensor};
use candle_nn::{conv2d, Conv2d, Conv2dConfig, VarBuilder};

fn conv1x1(in_dim: usize, out_dim: usize, vb: VarBuilder) -> Result<Conv2d> {
    conv2d(in_dim, out_dim, 1, Conv2dConfig::default(), vb)
}

/// `linear(x) + nonlinear(x)`
pub struct SegmentationHead {
    /// 1x1 conv input_dim -> dim
    linear: Conv2d,
    /// 1x1 conv input_dim -> input_dim
    nonlinear1: Conv2d,
    /// 1x1 conv input_dim -> dim, after ReLU
    nonlinear2: Conv2d,
    dim: usize,
}

impl SegmentationHead {
    /// Weight names follow the checkpoint layout `linear.0`, `nonlinear.0`, `nonlinear.2`
    pub fn load(vb: VarBuilder, input_dim: usize, dim: usize) -> Result<Self> {
        let linear = conv1x1(input_dim, dim, vb.pp("linear.0"))?;
        let nonlinear1 = conv1x1(input_dim, input_dim, vb.pp("nonlinear.0"))?;
        let nonlinear2 = conv1x1(input_dim, dim, vb.pp("nonlinear.2"))?;
        Ok(Self {
            linear,
            nonlinear1,
            nonlinear2,
            dim,
        })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }
}

impl Module for SegmentationHead {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let linear = self.linear.forward(xs)?;
        let nonlinear = self
            .nonlinear2
            .forward(&self.nonlinear1.forward(xs)?.relu()?)?;
        linear + nonlinear
    }
}

/// Supervised linear probe: 1x1 conv from the code to class logits
pub fn linear_probe(vb: VarBuilder, dim: usize, n_classes: usize) -> Result<Conv2d> {
    conv1x1(dim, n_classes, vb)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_head_output_shape() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let head = SegmentationHead::load(vb, 24, 7).unwrap();

        let feats = Tensor::randn(0f32, 1.0, (2, 24, 5, 6), &device).unwrap();
        let code = head.forward(&feats).unwrap();
        assert_eq!(code.dims(), &[2, 7, 5, 6]);
        assert_eq!(head.dim(), 7);
    }

    #[test]
    fn test_head_is_pointwise() {
        // A 1x1 head maps equal feature vectors to equal codes
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let head = SegmentationHead::load(vb, 8, 4).unwrap();

        let v = Tensor::randn(0f32, 1.0, (1, 8, 1, 1), &device).unwrap();
        let feats = v.broadcast_as((1, 8, 3, 3)).unwrap().contiguous().unwrap();
        let code = head.forward(&feats).unwrap();
        let spread: f32 = code
            .max_keepdim(3)
            .unwrap()
            .max_keepdim(2)
            .unwrap()
            .broadcast_sub(&code.min_keepdim(3).unwrap().min_keepdim(2).unwrap())
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(spread < 1e-5);
    }

    #[test]
    fn test_linear_probe_and_weight_names() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        SegmentationHead::load(vb.pp("segmentation_head"), 16, 8).unwrap();
        let probe = linear_probe(vb.pp("linear_probe"), 8, 5).unwrap();

        let code = Tensor::randn(0f32, 1.0, (1, 8, 4, 4), &device).unwrap();
        assert_eq!(probe.forward(&code).unwrap().dims(), &[1, 5, 4, 4]);

        let data = varmap.data().lock().unwrap();
        assert!(data.contains_key("segmentation_head.linear.0.weight"));
        assert!(data.contains_key("segmentation_head.nonlinear.2.bias"));
        assert!(data.contains_key("linear_probe.weight"));
    }
}
