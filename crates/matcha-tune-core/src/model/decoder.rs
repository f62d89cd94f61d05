//! Text decoder with cross-attention over encoder states.

use candle_core::{Device, Tensor};
use candle_nn::{embedding, linear_no_bias, Embedding, Linear, Module, VarBuilder};

use super::config::BackboneConfig;
use super::layers::{Attention, GatedGeluMlp, RmsNorm};
use crate::error::Result;

/// A single pre-norm decoder layer: causal self-attention, cross-attention,
/// gated MLP.
#[derive(Debug, Clone)]
pub struct DecoderLayer {
    self_attention_norm: RmsNorm,
    self_attention: Attention,
    cross_attention_norm: RmsNorm,
    cross_attention: Attention,
    mlp_norm: RmsNorm,
    mlp: GatedGeluMlp,
}

impl DecoderLayer {
    /// Create a decoder layer, registering parameters under `vb`.
    pub fn load(config: &BackboneConfig, vb: VarBuilder) -> Result<Self> {
        let self_attention_norm = RmsNorm::load(
            config.hidden_size,
            config.layer_norm_eps,
            vb.pp("self_attention_norm"),
        )?;
        let self_attention = Attention::load(
            config.hidden_size,
            config.num_attention_heads,
            vb.pp("self_attention"),
        )?;
        let cross_attention_norm = RmsNorm::load(
            config.hidden_size,
            config.layer_norm_eps,
            vb.pp("cross_attention_norm"),
        )?;
        let cross_attention = Attention::load(
            config.hidden_size,
            config.num_attention_heads,
            vb.pp("cross_attention"),
        )?;
        let mlp_norm = RmsNorm::load(config.hidden_size, config.layer_norm_eps, vb.pp("mlp_norm"))?;
        let mlp = GatedGeluMlp::load(config.hidden_size, config.intermediate_size, vb.pp("mlp"))?;
        Ok(Self {
            self_attention_norm,
            self_attention,
            cross_attention_norm,
            cross_attention,
            mlp_norm,
            mlp,
        })
    }

    /// Forward pass.
    ///
    /// * `hidden_states` - `[batch, seq, hidden]`
    /// * `encoder_states` - `[batch, kv_len, hidden]`
    /// * `causal_mask` - additive `[1, 1, seq, seq]` mask
    /// * `encoder_mask` - additive `[batch, 1, 1, kv_len]` padding mask
    pub fn forward(
        &self,
        hidden_states: &Tensor,
        encoder_states: &Tensor,
        causal_mask: &Tensor,
        encoder_mask: &Tensor,
    ) -> Result<Tensor> {
        let normed = self.self_attention_norm.forward(hidden_states)?;
        let attn_output = self
            .self_attention
            .forward(&normed, &normed, Some(causal_mask))?;
        let hidden_states = (hidden_states + attn_output)?;

        let normed = self.cross_attention_norm.forward(&hidden_states)?;
        let cross_output = self
            .cross_attention
            .forward(&normed, encoder_states, Some(encoder_mask))?;
        let hidden_states = (hidden_states + cross_output)?;

        let normed = self.mlp_norm.forward(&hidden_states)?;
        let mlp_output = self.mlp.forward(&normed)?;
        let output = (hidden_states + mlp_output)?;
        Ok(output)
    }
}

/// Text decoder: token + position embeddings, layer stack, final norm, and an
/// untied output projection.
#[derive(Debug, Clone)]
pub struct TextDecoder {
    embed_tokens: Embedding,
    embed_positions: Embedding,
    layers: Vec<DecoderLayer>,
    final_norm: RmsNorm,
    lm_head: Linear,
    hidden_size: usize,
}

impl TextDecoder {
    /// Create the decoder, registering parameters under `vb`.
    pub fn load(config: &BackboneConfig, vb: VarBuilder) -> Result<Self> {
        let embed_tokens = embedding(
            config.vocab_size,
            config.hidden_size,
            vb.pp("embed_tokens"),
        )?;
        let embed_positions = embedding(
            config.max_length,
            config.hidden_size,
            vb.pp("embed_positions"),
        )?;
        let layers = (0..config.num_decoder_layers)
            .map(|i| DecoderLayer::load(config, vb.pp(format!("layer.{i}"))))
            .collect::<Result<Vec<_>>>()?;
        let final_norm = RmsNorm::load(
            config.hidden_size,
            config.layer_norm_eps,
            vb.pp("final_norm"),
        )?;
        let lm_head = linear_no_bias(config.hidden_size, config.vocab_size, vb.pp("lm_head"))?;
        Ok(Self {
            embed_tokens,
            embed_positions,
            layers,
            final_norm,
            lm_head,
            hidden_size: config.hidden_size,
        })
    }

    /// Decode `[batch, seq]` token ids against encoder states, returning
    /// logits `[batch, seq, vocab]`.
    pub fn forward(
        &self,
        input_ids: &Tensor,
        encoder_states: &Tensor,
        encoder_mask: &Tensor,
    ) -> Result<Tensor> {
        let (batch, seq_len) = input_ids.dims2()?;
        let device = input_ids.device();

        let positions = Tensor::arange(0u32, seq_len as u32, device)?
            .unsqueeze(0)?
            .expand((batch, seq_len))?
            .contiguous()?;
        let hidden = (self.embed_tokens.forward(input_ids)?
            + self.embed_positions.forward(&positions)?)?;

        let causal_mask = causal_mask(seq_len, device)?;
        let mut hidden_states = hidden;
        for layer in &self.layers {
            hidden_states =
                layer.forward(&hidden_states, encoder_states, &causal_mask, encoder_mask)?;
        }
        let hidden_states = self.final_norm.forward(&hidden_states)?;
        let logits = self.lm_head.forward(&hidden_states)?;
        Ok(logits)
    }

    /// Replace the token embedding table (vocabulary resize).
    pub(crate) fn set_embed_tokens(&mut self, weight: Tensor) {
        self.embed_tokens = Embedding::new(weight, self.hidden_size);
    }

    /// Replace the output projection (vocabulary resize).
    pub(crate) fn set_lm_head(&mut self, weight: Tensor) {
        self.lm_head = Linear::new(weight, None);
    }
}

/// Create an additive causal mask `[1, 1, seq, seq]`:
/// `mask[i][j] = 0` when `j <= i`, a large negative value otherwise.
pub fn causal_mask(seq_len: usize, device: &Device) -> Result<Tensor> {
    let mut mask_data = vec![0.0f32; seq_len * seq_len];
    for i in 0..seq_len {
        for j in (i + 1)..seq_len {
            mask_data[i * seq_len + j] = -1e9;
        }
    }
    let mask = Tensor::from_slice(&mask_data, (seq_len, seq_len), device)?;
    let mask = mask.unsqueeze(0)?.unsqueeze(0)?;
    Ok(mask)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::{VarBuilder, VarMap};

    fn small_config() -> BackboneConfig {
        BackboneConfig {
            hidden_size: 32,
            intermediate_size: 64,
            num_attention_heads: 4,
            num_hidden_layers: 2,
            num_decoder_layers: 2,
            vocab_size: 100,
            patch_embedding_dim: 14,
            max_patches: 64,
            max_length: 16,
            ..BackboneConfig::default()
        }
    }

    #[test]
    fn decoder_forward_shape() {
        let config = small_config();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let decoder = TextDecoder::load(&config, vb.pp("decoder")).unwrap();

        let input_ids = Tensor::zeros((2, 6), DType::I64, &Device::Cpu).unwrap();
        let encoder_states = Tensor::randn(0.0f32, 1.0, &[2, 8, 32], &Device::Cpu).unwrap();
        let encoder_mask = Tensor::zeros((2, 1, 1, 8), DType::F32, &Device::Cpu).unwrap();

        let logits = decoder
            .forward(&input_ids, &encoder_states, &encoder_mask)
            .unwrap();
        assert_eq!(logits.dims(), &[2, 6, 100]);
    }

    #[test]
    fn causal_mask_blocks_future() {
        let mask = causal_mask(4, &Device::Cpu).unwrap();
        assert_eq!(mask.dims(), &[1, 1, 4, 4]);

        let vals: Vec<f32> = mask.flatten_all().unwrap().to_vec1().unwrap();
        // Row 0: only position 0 visible.
        assert_eq!(vals[0], 0.0);
        assert!(vals[1] <= -1e8);
        // Row 3: all positions visible.
        assert_eq!(&vals[12..16], &[0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn lm_head_replacement_changes_vocab() {
        let config = small_config();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let mut decoder = TextDecoder::load(&config, vb.pp("decoder")).unwrap();

        let new_head = Tensor::randn(0.0f32, 0.02, &[120, 32], &Device::Cpu).unwrap();
        decoder.set_lm_head(new_head);
        let new_embed = Tensor::randn(0.0f32, 0.02, &[120, 32], &Device::Cpu).unwrap();
        decoder.set_embed_tokens(new_embed);

        let input_ids = Tensor::zeros((1, 4), DType::I64, &Device::Cpu).unwrap();
        let encoder_states = Tensor::randn(0.0f32, 1.0, &[1, 8, 32], &Device::Cpu).unwrap();
        let encoder_mask = Tensor::zeros((1, 1, 1, 8), DType::F32, &Device::Cpu).unwrap();

        let logits = decoder
            .forward(&input_ids, &encoder_states, &encoder_mask)
            .unwrap();
        assert_eq!(logits.dims(), &[1, 4, 120]);
    }
}
