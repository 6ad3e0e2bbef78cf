//! Shape reconciliation between a base parameter and its delta.
//!
//! Shapes must match exactly, with one exception: vocabulary-dependent
//! matrices (token embeddings, output heads) whose leading dimension grew
//! because special tokens were added. In that case the base is widened to the
//! delta's row count, every original base row is kept in place and the new
//! rows start at zero, so they end up equal to the delta rows after the add.

use tracing::{info, warn};

use crate::{MergeError, Parameter, Result, TokenizerInfo};

/// Bring `base` to the shape of `delta`, or fail if that is not allowed.
pub fn reconcile(base: Parameter, delta: &Parameter, tokenizer: Option<&TokenizerInfo>) -> Result<Parameter> {
    if base.dtype() != delta.dtype() {
        return Err(MergeError::DtypeMismatch {
            name: base.name().to_string(),
            base: base.dtype(),
            delta: delta.dtype(),
        });
    }

    if base.shape() == delta.shape() {
        return Ok(base);
    }

    let mismatch = || MergeError::ShapeMismatch {
        name: base.name().to_string(),
        base: base.shape().to_vec(),
        delta: delta.shape().to_vec(),
    };

    let (b, d) = (base.shape(), delta.shape());
    let grows_rows = !b.is_empty() && b.len() == d.len() && b[1..] == d[1..] && d[0] > b[0];
    if !grows_rows {
        return Err(mismatch());
    }

    let (base_rows, rows) = (b[0], d[0]);
    if let Some(tok) = tokenizer {
        if rows != tok.vocab_size {
            return Err(mismatch());
        }
        if base_rows + tok.num_new_tokens != tok.vocab_size {
            warn!(
                "'{}' has {} base rows but the tokenizer reports {} - {} original tokens",
                base.name(),
                base_rows,
                tok.vocab_size,
                tok.num_new_tokens
            );
        }
    }

    info!("Growing '{}' from {} to {} rows", base.name(), base_rows, rows);
    Ok(base.grow_rows(rows))
}

/// Reconcile `base` against `delta` and return `base + delta`.
pub fn apply_delta(base: Parameter, delta: &Parameter, tokenizer: Option<&TokenizerInfo>) -> Result<Parameter> {
    let mut merged = reconcile(base, delta, tokenizer)?;
    merged.add_assign(delta)?;
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use safetensors::Dtype;

    fn embed(rows: usize, hidden: usize, value: f32) -> Parameter {
        Parameter::from_f32("model.embed_tokens.weight", vec![rows, hidden], &vec![value; rows * hidden])
            .unwrap()
    }

    #[test]
    fn test_matching_shapes_add() {
        let base = Parameter::from_f32("w", vec![2, 2], &[1.0, 2.0, 3.0, 4.0]).unwrap();
        let delta = Parameter::from_f32("w", vec![2, 2], &[0.5, 0.5, -3.0, 1.0]).unwrap();
        let merged = apply_delta(base, &delta, None).unwrap();
        assert_eq!(merged.to_f32_vec().unwrap(), vec![1.5, 2.5, 0.0, 5.0]);
    }

    #[test]
    fn test_vocab_growth_keeps_all_base_rows() {
        let base = Parameter::from_f32("embed", vec![2, 2], &[1.0, 2.0, 3.0, 4.0]).unwrap();
        let delta = Parameter::from_f32("embed", vec![3, 2], &[10.0, 10.0, 10.0, 10.0, 7.0, 8.0]).unwrap();

        let merged = apply_delta(base, &delta, None).unwrap();

        assert_eq!(merged.shape(), &[3, 2]);
        assert_eq!(
            merged.to_f32_vec().unwrap(),
            vec![11.0, 12.0, 13.0, 14.0, 7.0, 8.0]
        );
    }

    #[test]
    fn test_vocab_growth_checks_tokenizer_size() {
        let tok = TokenizerInfo {
            vocab_size: 33,
            num_new_tokens: 1,
        };
        let ok = apply_delta(embed(32, 4, 1.0), &embed(33, 4, 1.0), Some(&tok)).unwrap();
        assert_eq!(ok.shape(), &[33, 4]);

        let err = apply_delta(embed(32, 4, 1.0), &embed(34, 4, 1.0), Some(&tok)).unwrap_err();
        assert!(matches!(err, MergeError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_irreconcilable_shapes() {
        let cases = [
            (vec![4, 2], vec![4, 3]),
            (vec![4, 2], vec![8]),
            (vec![4, 2], vec![3, 2]),
            (vec![], vec![1]),
        ];
        for (b, d) in cases {
            let base = Parameter::zeros("w", Dtype::F32, b);
            let delta = Parameter::zeros("w", Dtype::F32, d);
            let err = apply_delta(base, &delta, None).unwrap_err();
            assert!(matches!(err, MergeError::ShapeMismatch { .. }), "{err}");
        }
    }

    #[test]
    fn test_dtype_mismatch() {
        let base = Parameter::zeros("w", Dtype::F32, vec![2]);
        let delta = Parameter::zeros("w", Dtype::BF16, vec![2]);
        let err = reconcile(base, &delta, None).unwrap_err();
        assert!(matches!(err, MergeError::DtypeMismatch { .. }));
    }
}
