use candle_core::{DType, Module, Result, Tensor, D};
use candle_nn::{Init, VarBuilder};

/// Layer normalization that divides by the unbiased standard deviation plus
/// `eps`, as the co-attention blocks expect.
#[derive(Clone, Debug)]
pub struct StdLayerNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl StdLayerNorm {
    pub fn new(weight: Tensor, bias: Tensor, eps: f64) -> Self {
        Self { weight, bias, eps }
    }
}

impl Module for StdLayerNorm {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let dtype = xs.dtype();
        let xs = xs.to_dtype(DType::F32)?;
        let n = xs.dim(D::Minus1)?;
        let mean = xs.mean_keepdim(D::Minus1)?;
        let centered = xs.broadcast_sub(&mean)?;
        let denom = (n.max(2) - 1) as f64;
        let std = (centered.sqr()?.sum_keepdim(D::Minus1)? / denom)?.sqrt()?;
        let normed = centered.broadcast_div(&(std + self.eps)?)?;
        normed
            .to_dtype(dtype)?
            .broadcast_mul(&self.weight)?
            .broadcast_add(&self.bias)
    }
}

/// Standard layer normalization built from differentiable tensor ops.
#[derive(Clone, Debug)]
pub struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl LayerNorm {
    pub fn new(weight: Tensor, bias: Tensor, eps: f64) -> Self {
        Self { weight, bias, eps }
    }
}

impl Module for LayerNorm {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let dtype = xs.dtype();
        let xs = xs.to_dtype(DType::F32)?;
        let mean = xs.mean_keepdim(D::Minus1)?;
        let centered = xs.broadcast_sub(&mean)?;
        let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
        let normed = centered.broadcast_div(&(var + self.eps)?.sqrt()?)?;
        normed
            .to_dtype(dtype)?
            .broadcast_mul(&self.weight)?
            .broadcast_add(&self.bias)
    }
}

/// Create a [`LayerNorm`], initialised to the identity affine map.
pub fn layer_norm(size: usize, eps: f64, vb: VarBuilder) -> Result<LayerNorm> {
    let weight = vb.get_with_hints(size, "weight", Init::Const(1.0))?;
    let bias = vb.get_with_hints(size, "bias", Init::Const(0.0))?;
    Ok(LayerNorm::new(weight, bias, eps))
}

/// Create a [`StdLayerNorm`], initialised to the identity affine map.
pub fn std_layer_norm(size: usize, eps: f64, vb: VarBuilder) -> Result<StdLayerNorm> {
    let weight = vb.get_with_hints(size, "weight", Init::Const(1.0))?;
    let bias = vb.get_with_hints(size, "bias", Init::Const(0.0))?;
    Ok(StdLayerNorm::new(weight, bias, eps))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn normalizes_last_dim() {
        let device = Device::Cpu;
        let norm = StdLayerNorm::new(
            Tensor::ones(4, DType::F32, &device).unwrap(),
            Tensor::zeros(4, DType::F32, &device).unwrap(),
            1e-6,
        );
        let xs = Tensor::new(&[[1.0f32, 2.0, 3.0, 4.0]], &device).unwrap();
        let out = norm.forward(&xs).unwrap().to_vec2::<f32>().unwrap();
        // unbiased std of 1..4 is sqrt(5/3)
        let std = (5.0f32 / 3.0).sqrt();
        assert!((out[0][0] + 1.5 / std).abs() < 1e-4);
        assert!((out[0][3] - 1.5 / std).abs() < 1e-4);
        let sum: f32 = out[0].iter().sum();
        assert!(sum.abs() < 1e-5);
    }

    #[test]
    fn layer_norm_matches_biased_variance() {
        let device = Device::Cpu;
        let norm = LayerNorm::new(
            Tensor::ones(4, DType::F32, &device).unwrap(),
            Tensor::zeros(4, DType::F32, &device).unwrap(),
            0.0,
        );
        let xs = Tensor::new(&[[1.0f32, 2.0, 3.0, 4.0]], &device).unwrap();
        let out = norm.forward(&xs).unwrap().to_vec2::<f32>().unwrap();
        let std = 1.25f32.sqrt();
        assert!((out[0][3] - 1.5 / std).abs() < 1e-4);
    }

    #[test]
    fn varmap_init_is_identity_affine() {
        let varmap = candle_nn::VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let norm = std_layer_norm(8, 1e-6, vb).unwrap();
        let xs = Tensor::randn(0f32, 1.0, (3, 8), &Device::Cpu).unwrap();
        let out = norm.forward(&xs).unwrap();
        assert_eq!(out.dims(), &[3, 8]);
        assert_eq!(varmap.all_vars().len(), 2);
    }
}
