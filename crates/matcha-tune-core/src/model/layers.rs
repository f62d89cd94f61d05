//! Building blocks shared by the vision encoder and text decoder.
//!
//! All parameters are created through a `VarBuilder` backed by the model's
//! `VarMap`, so every weight has a stable dotted name and participates in
//! autodiff. Projection layers carry no bias (T5/Pix2Struct convention), so
//! every parameter name in the backbone ends in `.weight`.

use candle_core::{Tensor, D};
use candle_nn::{linear_no_bias, Init, Linear, Module, VarBuilder};

use crate::error::Result;

/// T5-style RMS layer normalization (no centering, no bias).
///
/// `RmsNorm(x) = x * weight / sqrt(mean(x^2) + eps)`
#[derive(Debug, Clone)]
pub struct RmsNorm {
    /// Learnable scale parameter.
    weight: Tensor,
    /// Small constant for numerical stability.
    eps: f64,
}

impl RmsNorm {
    /// Create an RMSNorm layer, registering its weight under `vb`.
    pub fn load(hidden_size: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(hidden_size, "weight", Init::Const(1.0))?;
        Ok(Self { weight, eps })
    }

    /// Forward pass over `[..., hidden_size]`.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mean_sq = x.sqr()?.mean_keepdim(D::Minus1)?;
        let rsqrt = (mean_sq + self.eps)?.sqrt()?.recip()?;
        let output = x.broadcast_mul(&rsqrt)?.broadcast_mul(&self.weight)?;
        Ok(output)
    }
}

/// Multi-head attention usable for self- and cross-attention.
#[derive(Debug, Clone)]
pub struct Attention {
    query: Linear,
    key: Linear,
    value: Linear,
    output: Linear,
    num_heads: usize,
    head_dim: usize,
    hidden_size: usize,
}

impl Attention {
    /// Create an attention block, registering its projections under `vb`.
    pub fn load(hidden_size: usize, num_heads: usize, vb: VarBuilder) -> Result<Self> {
        let query = linear_no_bias(hidden_size, hidden_size, vb.pp("query"))?;
        let key = linear_no_bias(hidden_size, hidden_size, vb.pp("key"))?;
        let value = linear_no_bias(hidden_size, hidden_size, vb.pp("value"))?;
        let output = linear_no_bias(hidden_size, hidden_size, vb.pp("output"))?;
        Ok(Self {
            query,
            key,
            value,
            output,
            num_heads,
            head_dim: hidden_size / num_heads,
            hidden_size,
        })
    }

    /// Scaled dot-product attention.
    ///
    /// * `x` - query source `[batch, q_len, hidden]`
    /// * `kv` - key/value source `[batch, kv_len, hidden]` (equal to `x` for
    ///   self-attention)
    /// * `mask` - optional additive mask broadcastable to
    ///   `[batch, heads, q_len, kv_len]`
    pub fn forward(&self, x: &Tensor, kv: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        let (batch, q_len, _) = x.dims3()?;
        let kv_len = kv.dims3()?.1;

        let q = self
            .query
            .forward(x)?
            .reshape((batch, q_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let k = self
            .key
            .forward(kv)?
            .reshape((batch, kv_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let v = self
            .value
            .forward(kv)?
            .reshape((batch, kv_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let scores = (q.matmul(&k.transpose(2, 3)?)? * scale)?;
        let scores = match mask {
            Some(mask) => scores.broadcast_add(mask)?,
            None => scores,
        };
        let weights = candle_nn::ops::softmax(&scores, D::Minus1)?;

        let context = weights
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((batch, q_len, self.hidden_size))?;
        Ok(self.output.forward(&context)?)
    }
}

/// Gated-GELU MLP (T5.1.1/Pix2Struct feed-forward).
///
/// `GatedGelu(x) = (gelu(x @ wi_0^T) * (x @ wi_1^T)) @ wo^T`
#[derive(Debug, Clone)]
pub struct GatedGeluMlp {
    wi_0: Linear,
    wi_1: Linear,
    wo: Linear,
}

impl GatedGeluMlp {
    /// Create a gated MLP, registering its projections under `vb`.
    pub fn load(hidden_size: usize, intermediate_size: usize, vb: VarBuilder) -> Result<Self> {
        let wi_0 = linear_no_bias(hidden_size, intermediate_size, vb.pp("wi_0"))?;
        let wi_1 = linear_no_bias(hidden_size, intermediate_size, vb.pp("wi_1"))?;
        let wo = linear_no_bias(intermediate_size, hidden_size, vb.pp("wo"))?;
        Ok(Self { wi_0, wi_1, wo })
    }

    /// Forward pass over `[..., hidden_size]`.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let gate = self.wi_0.forward(x)?.gelu()?;
        let up = self.wi_1.forward(x)?;
        let output = self.wo.forward(&(gate * up)?)?;
        Ok(output)
    }
}
