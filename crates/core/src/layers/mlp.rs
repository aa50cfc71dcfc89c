use candle_core::{Result, Tensor};
use candle_nn::{linear, Dropout, Linear, Module, ModuleT, VarBuilder};

/// Linear layer with optional ReLU and dropout.
#[derive(Clone, Debug)]
pub struct FullyConnected {
    linear: Linear,
    use_relu: bool,
    dropout: Option<Dropout>,
}

impl FullyConnected {
    pub fn new(
        in_size: usize,
        out_size: usize,
        dropout: f32,
        use_relu: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let linear = linear(in_size, out_size, vb.pp("linear"))?;
        let dropout = (dropout > 0.0).then(|| Dropout::new(dropout));
        Ok(Self {
            linear,
            use_relu,
            dropout,
        })
    }
}

impl ModuleT for FullyConnected {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let mut xs = self.linear.forward(xs)?;
        if self.use_relu {
            xs = xs.relu()?;
        }
        match &self.dropout {
            Some(dropout) => dropout.forward_t(&xs, train),
            None => Ok(xs),
        }
    }
}

/// Two-layer perceptron: `FullyConnected` (ReLU) followed by a linear map.
#[derive(Clone, Debug)]
pub struct Mlp {
    fc: FullyConnected,
    linear: Linear,
}

impl Mlp {
    pub fn new(
        in_size: usize,
        mid_size: usize,
        out_size: usize,
        dropout: f32,
        use_relu: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let fc = FullyConnected::new(in_size, mid_size, dropout, use_relu, vb.pp("fc"))?;
        let linear = linear(mid_size, out_size, vb.pp("linear"))?;
        Ok(Self { fc, linear })
    }
}

impl ModuleT for Mlp {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        self.fc.forward_t(xs, train)?.apply(&self.linear)
    }
}
