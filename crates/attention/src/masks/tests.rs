use super::*;
use candle_core::{Device, Result};

#[test]
fn causal_mask_keeps_the_past_visible() -> Result<()> {
    let mask = make_causal_mask(2, 3, 2, &Device::Cpu)?;
    assert_eq!(mask.dims(), &[2, 1, 3, 5]);
    let rows = mask.get(1)?.get(0)?.to_vec2::<u8>()?;
    assert_eq!(
        rows,
        vec![
            vec![0, 0, 0, 1, 1],
            vec![0, 0, 0, 0, 1],
            vec![0, 0, 0, 0, 0],
        ]
    );
    Ok(())
}

#[test]
fn padding_mask_marks_zero_positions() -> Result<()> {
    let keep = Tensor::new(&[[0i64, 1, 1], [1, 1, 1]], &Device::Cpu)?;
    let mask = expand_padding_mask(&keep, 2)?;
    assert_eq!(mask.dims(), &[2, 1, 2, 3]);
    assert_eq!(mask.dtype(), MASK_DTYPE);
    assert_eq!(mask.get(0)?.get(0)?.to_vec2::<u8>()?, vec![vec![1, 0, 0]; 2]);
    assert_eq!(mask.get(1)?.get(0)?.to_vec2::<u8>()?, vec![vec![0, 0, 0]; 2]);
    Ok(())
}

#[test]
fn prepared_mask_combines_padding_and_causality() -> Result<()> {
    let keep = Tensor::new(&[[0u32, 1, 1]], &Device::Cpu)?;
    let mask = prepare_attention_mask(&keep, (1, 3), 0)?;
    assert_eq!(
        mask.get(0)?.get(0)?.to_vec2::<u8>()?,
        vec![vec![1, 1, 1], vec![1, 0, 1], vec![1, 0, 0]]
    );
    Ok(())
}

#[test]
fn single_query_skips_the_causal_part() -> Result<()> {
    let keep = Tensor::new(&[[1u32, 1, 1, 0]], &Device::Cpu)?;
    let mask = prepare_attention_mask(&keep, (1, 1), 3)?;
    assert_eq!(mask.dims(), &[1, 1, 1, 4]);
    assert_eq!(mask.flatten_all()?.to_vec1::<u8>()?, vec![0, 0, 0, 1]);
    Ok(())
}

#[test]
fn mismatched_widths_are_reported() -> Result<()> {
    let keep = Tensor::ones((1, 4), candle_core::DType::U32, &Device::Cpu)?;
    assert!(prepare_attention_mask(&keep, (1, 2), 0).is_err());
    Ok(())
}

#[test]
fn masked_fill_uses_dtype_minimum() -> Result<()> {
    let device = Device::Cpu;
    let scores = Tensor::zeros((1, 2, 2, 2), DType::F32, &device)?;
    let mask = make_causal_mask(1, 2, 0, &device)?;
    let filled = masked_fill(&scores, &mask, dtype_min(DType::F32)?)?;
    let values = filled.flatten_all()?.to_vec1::<f32>()?;
    assert_eq!(values, vec![0.0, f32::MIN, 0.0, 0.0, 0.0, f32::MIN, 0.0, 0.0]);
    assert!(dtype_min(DType::U8).is_err());
    Ok(())
}
