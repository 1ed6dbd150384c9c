//! Naive float kernels. Correct but unhurried; every other backend is
//! checked against these.
//!
//! Tensors are flat NHWC slices. Shape arrays, stride pairs, and filter
//! pairs are `[height, width]` ordered; padding pairs are `[top, left]`
//! (bottom/right overhang falls out of the bounds checks).

/// 2-D convolution.
///
/// - `input`:  `[N, H, W, Ci]`
/// - `filter`: `[Co, Kh, Kw, Ci]`
/// - `bias`:   `[Co]`
/// - `output`: `[N, Ho, Wo, Co]`
#[allow(clippy::too_many_arguments)]
pub fn conv2d(
    input: &[f32],
    input_shape: [usize; 4],
    filter: &[f32],
    filter_shape: [usize; 4],
    bias: &[f32],
    stride: [usize; 2],
    pad: [usize; 2],
    output: &mut [f32],
    output_shape: [usize; 4],
) {
    let [n, h, w, ci] = input_shape;
    let [co, kh, kw, _] = filter_shape;
    let [_, ho, wo, _] = output_shape;
    let [sh, sw] = stride;
    let [pad_top, pad_left] = pad;

    for batch in 0..n {
        for oy in 0..ho {
            for ox in 0..wo {
                for oc in 0..co {
                    let mut sum = bias[oc];
                    for ky in 0..kh {
                        for kx in 0..kw {
                            let iy_padded = oy * sh + ky;
                            let ix_padded = ox * sw + kx;
                            if iy_padded < pad_top || ix_padded < pad_left {
                                continue;
                            }
                            let iy = iy_padded - pad_top;
                            let ix = ix_padded - pad_left;
                            if iy >= h || ix >= w {
                                continue;
                            }
                            for ic in 0..ci {
                                let in_idx = batch * (h * w * ci) + iy * (w * ci) + ix * ci + ic;
                                let f_idx = oc * (kh * kw * ci) + ky * (kw * ci) + kx * ci + ic;
                                sum += input[in_idx] * filter[f_idx];
                            }
                        }
                    }
                    let out_idx = batch * (ho * wo * co) + oy * (wo * co) + ox * co + oc;
                    output[out_idx] = sum;
                }
            }
        }
    }
}

/// Depthwise 2-D convolution.
///
/// - `input`:  `[N, H, W, Ci]`
/// - `filter`: `[1, Kh, Kw, Co]` with `Co = Ci * depth_multiplier`
/// - `bias`:   `[Co]`
/// - `output`: `[N, Ho, Wo, Co]`
#[allow(clippy::too_many_arguments)]
pub fn depthwise_conv2d(
    input: &[f32],
    input_shape: [usize; 4],
    filter: &[f32],
    filter_shape: [usize; 4],
    bias: &[f32],
    stride: [usize; 2],
    depth_multiplier: usize,
    pad: [usize; 2],
    output: &mut [f32],
    output_shape: [usize; 4],
) {
    let [n, h, w, _ci] = input_shape;
    let [_, kh, kw, co] = filter_shape;
    let [_, ho, wo, _] = output_shape;
    let [sh, sw] = stride;
    let [pad_top, pad_left] = pad;
    let ci = input_shape[3];

    for batch in 0..n {
        for oy in 0..ho {
            for ox in 0..wo {
                for oc in 0..co {
                    let ic = oc / depth_multiplier;
                    let mut sum = bias[oc];
                    for ky in 0..kh {
                        for kx in 0..kw {
                            let iy_padded = oy * sh + ky;
                            let ix_padded = ox * sw + kx;
                            if iy_padded < pad_top || ix_padded < pad_left {
                                continue;
                            }
                            let iy = iy_padded - pad_top;
                            let ix = ix_padded - pad_left;
                            if iy >= h || ix >= w {
                                continue;
                            }
                            let in_idx = batch * (h * w * ci) + iy * (w * ci) + ix * ci + ic;
                            let f_idx = ky * (kw * co) + kx * co + oc;
                            sum += input[in_idx] * filter[f_idx];
                        }
                    }
                    let out_idx = batch * (ho * wo * co) + oy * (wo * co) + ox * co + oc;
                    output[out_idx] = sum;
                }
            }
        }
    }
}

/// 2-D average pooling. Padded cells are excluded from the mean, so edge
/// windows divide by the number of in-bounds cells only.
///
/// - `input`:  `[N, H, W, C]`
/// - `output`: `[N, Ho, Wo, C]`
#[allow(clippy::too_many_arguments)]
pub fn avg_pool2d(
    input: &[f32],
    input_shape: [usize; 4],
    filter: [usize; 2],
    stride: [usize; 2],
    pad: [usize; 2],
    output: &mut [f32],
    output_shape: [usize; 4],
) {
    let [n, h, w, c] = input_shape;
    let [kh, kw] = filter;
    let [sh, sw] = stride;
    let [pad_top, pad_left] = pad;
    let [_, ho, wo, _] = output_shape;

    for batch in 0..n {
        for oy in 0..ho {
            for ox in 0..wo {
                for ch in 0..c {
                    let mut sum = 0.0;
                    let mut count = 0usize;
                    for ky in 0..kh {
                        for kx in 0..kw {
                            let iy_padded = oy * sh + ky;
                            let ix_padded = ox * sw + kx;
                            if iy_padded < pad_top || ix_padded < pad_left {
                                continue;
                            }
                            let iy = iy_padded - pad_top;
                            let ix = ix_padded - pad_left;
                            if iy >= h || ix >= w {
                                continue;
                            }
                            sum += input[batch * (h * w * c) + iy * (w * c) + ix * c + ch];
                            count += 1;
                        }
                    }
                    let out_idx = batch * (ho * wo * c) + oy * (wo * c) + ox * c + ch;
                    output[out_idx] = if count > 0 { sum / count as f32 } else { 0.0 };
                }
            }
        }
    }
}

/// 2-D max pooling.
///
/// - `input`:  `[N, H, W, C]`
/// - `output`: `[N, Ho, Wo, C]`
#[allow(clippy::too_many_arguments)]
pub fn max_pool2d(
    input: &[f32],
    input_shape: [usize; 4],
    filter: [usize; 2],
    stride: [usize; 2],
    pad: [usize; 2],
    output: &mut [f32],
    output_shape: [usize; 4],
) {
    let [n, h, w, c] = input_shape;
    let [kh, kw] = filter;
    let [sh, sw] = stride;
    let [pad_top, pad_left] = pad;
    let [_, ho, wo, _] = output_shape;

    for batch in 0..n {
        for oy in 0..ho {
            for ox in 0..wo {
                for ch in 0..c {
                    let mut max_val = f32::NEG_INFINITY;
                    for ky in 0..kh {
                        for kx in 0..kw {
                            let iy_padded = oy * sh + ky;
                            let ix_padded = ox * sw + kx;
                            if iy_padded < pad_top || ix_padded < pad_left {
                                continue;
                            }
                            let iy = iy_padded - pad_top;
                            let ix = ix_padded - pad_left;
                            if iy >= h || ix >= w {
                                continue;
                            }
                            let val = input[batch * (h * w * c) + iy * (w * c) + ix * c + ch];
                            if val > max_val {
                                max_val = val;
                            }
                        }
                    }
                    let out_idx = batch * (ho * wo * c) + oy * (wo * c) + ox * c + ch;
                    output[out_idx] = max_val;
                }
            }
        }
    }
}

/// Fully connected layer over a flattened batch.
///
/// - `input`:   `[batch, in_features]` (higher ranks pre-flattened)
/// - `weights`: `[out_features, in_features]`
/// - `bias`:    `[out_features]`
/// - `output`:  `[batch, out_features]`
pub fn fully_connected(
    input: &[f32],
    weights: &[f32],
    bias: &[f32],
    in_features: usize,
    out_features: usize,
    output: &mut [f32],
) {
    let batch = input.len() / in_features;
    for b in 0..batch {
        for o in 0..out_features {
            let mut sum = bias[o];
            for i in 0..in_features {
                sum += input[b * in_features + i] * weights[o * in_features + i];
            }
            output[b * out_features + o] = sum;
        }
    }
}

/// Softmax over the innermost dimension, with logit scaling.
///
/// Uses the max-subtraction form so large logits do not overflow.
pub fn softmax(input: &[f32], inner: usize, beta: f32, output: &mut [f32]) {
    for (row_in, row_out) in input.chunks_exact(inner).zip(output.chunks_exact_mut(inner)) {
        let max = row_in.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let mut denom = 0.0;
        for (slot, &x) in row_out.iter_mut().zip(row_in) {
            let e = ((x - max) * beta).exp();
            *slot = e;
            denom += e;
        }
        for slot in row_out.iter_mut() {
            *slot /= denom;
        }
    }
}

/// Logistic sigmoid, element-wise.
pub fn logistic(input: &[f32], output: &mut [f32]) {
    for (slot, &x) in output.iter_mut().zip(input) {
        *slot = 1.0 / (1.0 + (-x).exp());
    }
}

/// Hyperbolic tangent, element-wise.
pub fn tanh(input: &[f32], output: &mut [f32]) {
    for (slot, &x) in output.iter_mut().zip(input) {
        *slot = x.tanh();
    }
}

/// Bilinear spatial resize (corner-aligned to pixel origins, the TFLite
/// default: source position = dest position × input/output ratio).
///
/// - `input`:  `[N, H, W, C]`
/// - `output`: `[N, Ho, Wo, C]`
pub fn resize_bilinear(
    input: &[f32],
    input_shape: [usize; 4],
    output: &mut [f32],
    output_shape: [usize; 4],
) {
    let [n, h, w, c] = input_shape;
    let [_, ho, wo, _] = output_shape;
    let scale_y = h as f32 / ho as f32;
    let scale_x = w as f32 / wo as f32;

    for batch in 0..n {
        for oy in 0..ho {
            let sy = oy as f32 * scale_y;
            let y0 = sy.floor() as usize;
            let y1 = (y0 + 1).min(h - 1);
            let fy = sy - y0 as f32;
            for ox in 0..wo {
                let sx = ox as f32 * scale_x;
                let x0 = sx.floor() as usize;
                let x1 = (x0 + 1).min(w - 1);
                let fx = sx - x0 as f32;
                for ch in 0..c {
                    let at = |y: usize, x: usize| {
                        input[batch * (h * w * c) + y * (w * c) + x * c + ch]
                    };
                    let top = at(y0, x0) * (1.0 - fx) + at(y0, x1) * fx;
                    let bottom = at(y1, x0) * (1.0 - fx) + at(y1, x1) * fx;
                    let out_idx = batch * (ho * wo * c) + oy * (wo * c) + ox * c + ch;
                    output[out_idx] = top * (1.0 - fy) + bottom * fy;
                }
            }
        }
    }
}

/// Element-wise binary operation with trailing-dimension broadcasting.
///
/// Each input dimension must equal the output dimension or 1; missing
/// leading dimensions broadcast.
pub fn elementwise_broadcast<F: Fn(f32, f32) -> f32>(
    a: &[f32],
    a_dims: &[u32],
    b: &[f32],
    b_dims: &[u32],
    out: &mut [f32],
    out_dims: &[u32],
    f: F,
) {
    let rank = out_dims.len();
    let strides = |dims: &[u32]| {
        let mut s = vec![0usize; rank];
        let mut stride = 1usize;
        for i in (0..dims.len()).rev() {
            let pos = rank - dims.len() + i;
            s[pos] = if dims[i] == 1 { 0 } else { stride };
            stride *= dims[i] as usize;
        }
        s
    };
    let a_strides = strides(a_dims);
    let b_strides = strides(b_dims);

    for (idx, slot) in out.iter_mut().enumerate() {
        let mut rem = idx;
        let mut ai = 0usize;
        let mut bi = 0usize;
        for d in (0..rank).rev() {
            let dim = out_dims[d] as usize;
            let coord = rem % dim;
            rem /= dim;
            ai += coord * a_strides[d];
            bi += coord * b_strides[d];
        }
        *slot = f(a[ai], b[bi]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conv2d_identity_filter() {
        // 1x1 filter with weight 1 passes the input through.
        let input: Vec<f32> = (1..=9).map(|v| v as f32).collect();
        let filter = [1.0];
        let bias = [0.0];
        let mut out = [0.0; 9];
        conv2d(
            &input,
            [1, 3, 3, 1],
            &filter,
            [1, 1, 1, 1],
            &bias,
            [1, 1],
            [0, 0],
            &mut out,
            [1, 3, 3, 1],
        );
        assert_eq!(out.to_vec(), input);
    }

    #[test]
    fn conv2d_sums_window_and_bias() {
        // 2x2 ones filter over a 3x3 ramp, valid padding.
        let input: Vec<f32> = (1..=9).map(|v| v as f32).collect();
        let filter = [1.0; 4];
        let bias = [10.0];
        let mut out = [0.0; 4];
        conv2d(
            &input,
            [1, 3, 3, 1],
            &filter,
            [1, 2, 2, 1],
            &bias,
            [1, 1],
            [0, 0],
            &mut out,
            [1, 2, 2, 1],
        );
        // Window sums: 1+2+4+5, 2+3+5+6, 4+5+7+8, 5+6+8+9, plus bias.
        assert_eq!(out, [22.0, 26.0, 34.0, 38.0]);
    }

    #[test]
    fn conv2d_padding_treats_outside_as_zero() {
        let input = [1.0, 2.0, 3.0, 4.0];
        let filter = [1.0; 9];
        let bias = [0.0];
        let mut out = [0.0; 4];
        conv2d(
            &input,
            [1, 2, 2, 1],
            &filter,
            [1, 3, 3, 1],
            &bias,
            [1, 1],
            [1, 1],
            &mut out,
            [1, 2, 2, 1],
        );
        // Every 3x3 window covers the whole 2x2 input at the corners.
        assert_eq!(out, [10.0; 4]);
    }

    #[test]
    fn depthwise_keeps_channels_independent() {
        // Two channels, 1x1 filter scaling ch0 by 2 and ch1 by 3.
        let input = [1.0, 10.0, 2.0, 20.0];
        let filter = [2.0, 3.0];
        let bias = [0.0, 0.0];
        let mut out = [0.0; 4];
        depthwise_conv2d(
            &input,
            [1, 1, 2, 2],
            &filter,
            [1, 1, 1, 2],
            &bias,
            [1, 1],
            1,
            [0, 0],
            &mut out,
            [1, 1, 2, 2],
        );
        assert_eq!(out, [2.0, 30.0, 4.0, 60.0]);
    }

    #[test]
    fn depthwise_multiplier_expands_channels() {
        // One input channel, multiplier 2: filters [a, b] per position.
        let input = [1.0, 2.0];
        let filter = [3.0, 4.0];
        let bias = [0.0, 0.0];
        let mut out = [0.0; 4];
        depthwise_conv2d(
            &input,
            [1, 1, 2, 1],
            &filter,
            [1, 1, 1, 2],
            &bias,
            [1, 1],
            2,
            [0, 0],
            &mut out,
            [1, 1, 2, 2],
        );
        assert_eq!(out, [3.0, 4.0, 6.0, 8.0]);
    }

    #[test]
    fn avg_pool_divides_by_valid_cells_only() {
        let input = [2.0, 4.0, 6.0, 8.0];
        let mut out = [0.0; 4];
        // 2x2 window, stride 1, one row/col of implicit right/bottom pad.
        avg_pool2d(&input, [1, 2, 2, 1], [2, 2], [1, 1], [0, 0], &mut out, [1, 2, 2, 1]);
        assert_eq!(out, [5.0, 6.0, 7.0, 8.0]);
    }

    #[test]
    fn max_pool_picks_window_maximum() {
        let input = [1.0, 5.0, 3.0, 2.0, 4.0, 8.0, 7.0, 6.0, 9.0];
        let mut out = [0.0; 4];
        max_pool2d(&input, [1, 3, 3, 1], [2, 2], [1, 1], [0, 0], &mut out, [1, 2, 2, 1]);
        assert_eq!(out, [5.0, 8.0, 7.0, 9.0]);
    }

    #[test]
    fn fully_connected_batched() {
        // weights: [[1, 2], [3, 4]], bias [0.5, -0.5], two batch rows.
        let input = [1.0, 1.0, 2.0, 0.0];
        let weights = [1.0, 2.0, 3.0, 4.0];
        let bias = [0.5, -0.5];
        let mut out = [0.0; 4];
        fully_connected(&input, &weights, &bias, 2, 2, &mut out);
        assert_eq!(out, [3.5, 6.5, 2.5, 5.5]);
    }

    #[test]
    fn softmax_rows_sum_to_one() {
        let input = [1.0, 2.0, 3.0, 1.0, 1.0, 1.0];
        let mut out = [0.0; 6];
        softmax(&input, 3, 1.0, &mut out);
        let row0: f32 = out[..3].iter().sum();
        let row1: f32 = out[3..].iter().sum();
        assert!((row0 - 1.0).abs() < 1e-6);
        assert!((row1 - 1.0).abs() < 1e-6);
        assert!(out[2] > out[1] && out[1] > out[0]);
        assert!((out[3] - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn softmax_beta_sharpens() {
        let input = [0.0, 1.0];
        let mut soft = [0.0; 2];
        let mut sharp = [0.0; 2];
        softmax(&input, 2, 1.0, &mut soft);
        softmax(&input, 2, 4.0, &mut sharp);
        assert!(sharp[1] > soft[1]);
    }

    #[test]
    fn logistic_and_tanh_known_points() {
        let input = [0.0, 1.0];
        let mut out = [0.0; 2];
        logistic(&input, &mut out);
        assert!((out[0] - 0.5).abs() < 1e-6);
        assert!((out[1] - 0.731_058_6).abs() < 1e-6);

        tanh(&input, &mut out);
        assert!(out[0].abs() < 1e-6);
        assert!((out[1] - 0.761_594_2).abs() < 1e-6);
    }

    #[test]
    fn resize_bilinear_doubles_with_interpolation() {
        let input = [0.0, 2.0, 4.0, 6.0];
        let mut out = [0.0; 16];
        resize_bilinear(&input, [1, 2, 2, 1], &mut out, [1, 4, 4, 1]);
        // Row 0 samples x at 0, 0.5, 1, 1.5 (clamped): 0, 1, 2, 2.
        assert_eq!(&out[..4], &[0.0, 1.0, 2.0, 2.0]);
        // Column 0 samples y the same way: 0, 2, 4, 4.
        assert_eq!([out[0], out[4], out[8], out[12]], [0.0, 2.0, 4.0, 4.0]);
    }

    #[test]
    fn broadcast_adds_channel_bias() {
        let a = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let b = [10.0, 20.0, 30.0];
        let mut out = [0.0; 6];
        elementwise_broadcast(&a, &[1, 2, 3], &b, &[3], &mut out, &[1, 2, 3], |x, y| x + y);
        assert_eq!(out, [11.0, 22.0, 33.0, 14.0, 25.0, 36.0]);
    }

    #[test]
    fn broadcast_scalar_multiplies_everything() {
        let a = [1.0, 2.0, 3.0, 4.0];
        let b = [0.5];
        let mut out = [0.0; 4];
        elementwise_broadcast(&a, &[2, 2], &b, &[1], &mut out, &[2, 2], |x, y| x * y);
        assert_eq!(out, [0.5, 1.0, 1.5, 2.0]);
    }
}
