//! Vision encoder over flattened image patches.
//!
//! Pix2Struct layout: each patch row carries its (row, column) position in
//! the first two columns and raw pixel values in the rest. The embedder sums
//! a linear projection of the pixels with learned row/column embeddings, so
//! no separate position tensor is needed.

use candle_core::{DType, Tensor};
use candle_nn::{embedding, linear_no_bias, Embedding, Linear, Module, VarBuilder};

use super::config::BackboneConfig;
use super::layers::{Attention, GatedGeluMlp, RmsNorm};
use crate::error::Result;

/// Patch embedder: pixel projection plus row/column index embeddings.
#[derive(Debug, Clone)]
pub struct PatchEmbeddings {
    patch_projection: Linear,
    row_embedder: Embedding,
    column_embedder: Embedding,
    patch_dim: usize,
}

impl PatchEmbeddings {
    /// Create the embedder, registering parameters under `vb`.
    pub fn load(config: &BackboneConfig, vb: VarBuilder) -> Result<Self> {
        let pixel_dim = config.patch_embedding_dim - 2;
        let patch_projection =
            linear_no_bias(pixel_dim, config.hidden_size, vb.pp("patch_projection"))?;
        let row_embedder = embedding(
            config.max_patches,
            config.hidden_size,
            vb.pp("row_embedder"),
        )?;
        let column_embedder = embedding(
            config.max_patches,
            config.hidden_size,
            vb.pp("column_embedder"),
        )?;
        Ok(Self {
            patch_projection,
            row_embedder,
            column_embedder,
            patch_dim: config.patch_embedding_dim,
        })
    }

    /// Embed `[batch, num_patches, patch_dim]` into `[batch, num_patches, hidden]`.
    pub fn forward(&self, flattened_patches: &Tensor) -> Result<Tensor> {
        let rows = flattened_patches
            .narrow(2, 0, 1)?
            .squeeze(2)?
            .to_dtype(DType::U32)?;
        let cols = flattened_patches
            .narrow(2, 1, 1)?
            .squeeze(2)?
            .to_dtype(DType::U32)?;
        let pixels = flattened_patches.narrow(2, 2, self.patch_dim - 2)?;

        let embedded = self.patch_projection.forward(&pixels.contiguous()?)?;
        let embedded = (embedded + self.row_embedder.forward(&rows)?)?;
        let embedded = (embedded + self.column_embedder.forward(&cols)?)?;
        Ok(embedded)
    }
}

/// A single pre-norm encoder layer: self-attention then gated MLP.
#[derive(Debug, Clone)]
pub struct EncoderLayer {
    attention_norm: RmsNorm,
    attention: Attention,
    mlp_norm: RmsNorm,
    mlp: GatedGeluMlp,
}

impl EncoderLayer {
    /// Create an encoder layer, registering parameters under `vb`.
    pub fn load(config: &BackboneConfig, vb: VarBuilder) -> Result<Self> {
        let attention_norm = RmsNorm::load(
            config.hidden_size,
            config.layer_norm_eps,
            vb.pp("attention_norm"),
        )?;
        let attention = Attention::load(
            config.hidden_size,
            config.num_attention_heads,
            vb.pp("attention"),
        )?;
        let mlp_norm = RmsNorm::load(config.hidden_size, config.layer_norm_eps, vb.pp("mlp_norm"))?;
        let mlp = GatedGeluMlp::load(config.hidden_size, config.intermediate_size, vb.pp("mlp"))?;
        Ok(Self {
            attention_norm,
            attention,
            mlp_norm,
            mlp,
        })
    }

    /// Forward pass with optional additive padding mask.
    pub fn forward(&self, hidden_states: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        let normed = self.attention_norm.forward(hidden_states)?;
        let attn_output = self.attention.forward(&normed, &normed, mask)?;
        let hidden_states = (hidden_states + attn_output)?;

        let normed = self.mlp_norm.forward(&hidden_states)?;
        let mlp_output = self.mlp.forward(&normed)?;
        let output = (hidden_states + mlp_output)?;
        Ok(output)
    }
}

/// Vision encoder: patch embeddings, a stack of layers, and a final norm.
#[derive(Debug, Clone)]
pub struct VisionEncoder {
    embeddings: PatchEmbeddings,
    layers: Vec<EncoderLayer>,
    final_norm: RmsNorm,
}

impl VisionEncoder {
    /// Create the encoder, registering parameters under `vb`.
    ///
    /// Parameter names follow `embeddings.*`, `layer.{i}.*`, `final_norm.*`
    /// relative to the builder prefix; the freeze policy in the model wrapper
    /// matches on these prefixes.
    pub fn load(config: &BackboneConfig, vb: VarBuilder) -> Result<Self> {
        let embeddings = PatchEmbeddings::load(config, vb.pp("embeddings"))?;
        let layers = (0..config.num_hidden_layers)
            .map(|i| EncoderLayer::load(config, vb.pp(format!("layer.{i}"))))
            .collect::<Result<Vec<_>>>()?;
        let final_norm = RmsNorm::load(
            config.hidden_size,
            config.layer_norm_eps,
            vb.pp("final_norm"),
        )?;
        Ok(Self {
            embeddings,
            layers,
            final_norm,
        })
    }

    /// Encode `[batch, num_patches, patch_dim]` with a 1/0 padding mask over
    /// patches into `[batch, num_patches, hidden]`.
    pub fn forward(&self, flattened_patches: &Tensor, attention_mask: &Tensor) -> Result<Tensor> {
        let mask = padding_mask(attention_mask)?;
        let mut hidden_states = self.embeddings.forward(flattened_patches)?;
        for layer in &self.layers {
            hidden_states = layer.forward(&hidden_states, Some(&mask))?;
        }
        let output = self.final_norm.forward(&hidden_states)?;
        Ok(output)
    }
}

/// Turn a `[batch, kv_len]` 1/0 mask into an additive `[batch, 1, 1, kv_len]`
/// mask: valid positions become 0, padded positions a large negative value.
pub fn padding_mask(attention_mask: &Tensor) -> Result<Tensor> {
    let mask = attention_mask.to_dtype(DType::F32)?;
    // 1 - mask, then scale: padded positions get -1e9 before softmax.
    let additive = (mask.affine(-1.0, 1.0)? * -1e9)?;
    let additive = additive.unsqueeze(1)?.unsqueeze(1)?;
    Ok(additive)
}
