//! Reverse-mode automatic differentiation (§4.10). Every forward op
//! allocates a new tensor carrying a `backward` closure that maps an
//! incoming gradient to one gradient per parent, in parent order.

use crate::value::TensorRef;
use parking_lot::Mutex;
use std::collections::HashSet;
use triomphe::Arc;

pub type BackwardFn = Box<dyn Fn(&[f64]) -> Vec<Vec<f64>> + Send + Sync>;

pub struct TensorData {
    pub data: Vec<f64>,
    pub shape: Vec<usize>,
    pub grad: Option<Vec<f64>>,
    pub parents: Vec<TensorRef>,
    pub backward: Option<BackwardFn>,
}

impl std::fmt::Debug for TensorData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TensorData")
            .field("shape", &self.shape)
            .field("has_grad", &self.grad.is_some())
            .field("parents", &self.parents.len())
            .finish()
    }
}

fn numel(shape: &[usize]) -> usize {
    shape.iter().product()
}

pub fn leaf(data: Vec<f64>, shape: Vec<usize>) -> TensorRef {
    assert_eq!(data.len(), numel(&shape));
    Arc::new(Mutex::new(TensorData { data, shape, grad: None, parents: vec![], backward: None }))
}

fn node(data: Vec<f64>, shape: Vec<usize>, parents: Vec<TensorRef>, backward: BackwardFn) -> TensorRef {
    Arc::new(Mutex::new(TensorData { data, shape, grad: None, parents, backward: Some(backward) }))
}

/// Reduce a gradient broadcast up to `from_shape` back down to
/// `to_shape` by summing over broadcast axes (used by `add`/`sub` when
/// operand shapes differ, e.g. bias row `[1,C]` against `[R,C]`).
fn reduce_broadcast(g: &[f64], from_shape: &[usize], to_shape: &[usize]) -> Vec<f64> {
    if from_shape == to_shape {
        return g.to_vec();
    }
    if numel(to_shape) == 1 {
        return vec![g.iter().sum()];
    }
    // row broadcast: to_shape == [1, C] or [C], from_shape == [R, C]
    if let (Some(&rows), Some(&cols)) = (from_shape.first(), from_shape.get(1)) {
        if numel(to_shape) == cols {
            let mut out = vec![0.0; cols];
            for r in 0..rows {
                for c in 0..cols {
                    out[c] += g[r * cols + c];
                }
            }
            return out;
        }
    }
    g.to_vec()
}

fn broadcast_shape(a: &[usize], b: &[usize]) -> Vec<usize> {
    if a == b {
        a.to_vec()
    } else if numel(a) == 1 {
        b.to_vec()
    } else if numel(b) == 1 {
        a.to_vec()
    } else {
        a.to_vec()
    }
}

fn broadcast_get(data: &[f64], shape: &[usize], target_shape: &[usize], flat_idx: usize) -> f64 {
    if shape == target_shape {
        return data[flat_idx];
    }
    if numel(shape) == 1 {
        return data[0];
    }
    // row-broadcast against the last dimension
    let cols = *shape.last().unwrap_or(&1);
    data[flat_idx % cols]
}

pub fn add(a: &TensorRef, b: &TensorRef) -> TensorRef {
    let (a_data, a_shape) = {
        let g = a.lock();
        (g.data.clone(), g.shape.clone())
    };
    let (b_data, b_shape) = {
        let g = b.lock();
        (g.data.clone(), g.shape.clone())
    };
    let out_shape = broadcast_shape(&a_shape, &b_shape);
    let n = numel(&out_shape);
    let data: Vec<f64> = (0..n)
        .map(|i| broadcast_get(&a_data, &a_shape, &out_shape, i) + broadcast_get(&b_data, &b_shape, &out_shape, i))
        .collect();
    let (as_, bs_) = (a_shape.clone(), b_shape.clone());
    node(data, out_shape.clone(), vec![a.clone(), b.clone()], Box::new(move |g| {
        vec![reduce_broadcast(g, &out_shape, &as_), reduce_broadcast(g, &out_shape, &bs_)]
    }))
}

pub fn sub(a: &TensorRef, b: &TensorRef) -> TensorRef {
    let (a_data, a_shape) = {
        let g = a.lock();
        (g.data.clone(), g.shape.clone())
    };
    let (b_data, b_shape) = {
        let g = b.lock();
        (g.data.clone(), g.shape.clone())
    };
    let out_shape = broadcast_shape(&a_shape, &b_shape);
    let n = numel(&out_shape);
    let data: Vec<f64> = (0..n)
        .map(|i| broadcast_get(&a_data, &a_shape, &out_shape, i) - broadcast_get(&b_data, &b_shape, &out_shape, i))
        .collect();
    let (as_, bs_) = (a_shape.clone(), b_shape.clone());
    node(data, out_shape.clone(), vec![a.clone(), b.clone()], Box::new(move |g| {
        let neg: Vec<f64> = g.iter().map(|x| -x).collect();
        vec![reduce_broadcast(g, &out_shape, &as_), reduce_broadcast(&neg, &out_shape, &bs_)]
    }))
}

pub fn mul(a: &TensorRef, b: &TensorRef) -> TensorRef {
    let (a_data, a_shape) = {
        let g = a.lock();
        (g.data.clone(), g.shape.clone())
    };
    let (b_data, b_shape) = {
        let g = b.lock();
        (g.data.clone(), g.shape.clone())
    };
    let out_shape = broadcast_shape(&a_shape, &b_shape);
    let n = numel(&out_shape);
    let data: Vec<f64> = (0..n)
        .map(|i| broadcast_get(&a_data, &a_shape, &out_shape, i) * broadcast_get(&b_data, &b_shape, &out_shape, i))
        .collect();
    let (ad, bd, as_, bs_) = (a_data, b_data, a_shape, b_shape);
    node(data, out_shape.clone(), vec![a.clone(), b.clone()], Box::new(move |g| {
        let ga: Vec<f64> = (0..n).map(|i| g[i] * broadcast_get(&bd, &bs_, &out_shape, i)).collect();
        let gb: Vec<f64> = (0..n).map(|i| g[i] * broadcast_get(&ad, &as_, &out_shape, i)).collect();
        vec![reduce_broadcast(&ga, &out_shape, &as_), reduce_broadcast(&gb, &out_shape, &bs_)]
    }))
}

/// `div(a, scalar)` (§4.10): scalar denominators only.
pub fn div_scalar(a: &TensorRef, scalar: f64) -> TensorRef {
    let (a_data, a_shape) = {
        let g = a.lock();
        (g.data.clone(), g.shape.clone())
    };
    let data: Vec<f64> = a_data.iter().map(|x| x / scalar).collect();
    node(data, a_shape, vec![a.clone()], Box::new(move |g| vec![g.iter().map(|x| x / scalar).collect()]))
}

pub fn pow_scalar(x: &TensorRef, n: f64) -> TensorRef {
    let (x_data, x_shape) = {
        let g = x.lock();
        (g.data.clone(), g.shape.clone())
    };
    let data: Vec<f64> = x_data.iter().map(|v| v.powf(n)).collect();
    let xd = x_data.clone();
    node(data, x_shape, vec![x.clone()], Box::new(move |g| {
        vec![g.iter().zip(xd.iter()).map(|(gi, xi)| gi * n * xi.powf(n - 1.0)).collect()]
    }))
}

pub fn matmul(a: &TensorRef, b: &TensorRef) -> TensorRef {
    let (a_data, a_shape) = {
        let g = a.lock();
        (g.data.clone(), g.shape.clone())
    };
    let (b_data, b_shape) = {
        let g = b.lock();
        (g.data.clone(), g.shape.clone())
    };
    let (m, k) = (a_shape[0], a_shape[1]);
    let (k2, n) = (b_shape[0], b_shape[1]);
    assert_eq!(k, k2, "matmul: inner dimensions must match");
    let mut data = vec![0.0; m * n];
    for i in 0..m {
        for j in 0..n {
            let mut acc = 0.0;
            for t in 0..k {
                acc += a_data[i * k + t] * b_data[t * n + j];
            }
            data[i * n + j] = acc;
        }
    }
    let (ad, bd) = (a_data, b_data);
    let (ash, bsh) = (a_shape.clone(), b_shape.clone());
    node(data, vec![m, n], vec![a.clone(), b.clone()], Box::new(move |g| {
        // g @ bT
        let mut ga = vec![0.0; m * k];
        for i in 0..m {
            for t in 0..k {
                let mut acc = 0.0;
                for j in 0..n {
                    acc += g[i * n + j] * bd[t * n + j];
                }
                ga[i * k + t] = acc;
            }
        }
        // aT @ g
        let mut gb = vec![0.0; k * n];
        for t in 0..k {
            for j in 0..n {
                let mut acc = 0.0;
                for i in 0..m {
                    acc += ad[i * k + t] * g[i * n + j];
                }
                gb[t * n + j] = acc;
            }
        }
        let _ = (&ash, &bsh);
        vec![ga, gb]
    }))
}

pub fn sum(x: &TensorRef) -> TensorRef {
    let (x_data, x_shape) = {
        let g = x.lock();
        (g.data.clone(), g.shape.clone())
    };
    let total: f64 = x_data.iter().sum();
    let n = x_data.len();
    node(vec![total], vec![1], vec![x.clone()], Box::new(move |g| vec![vec![g[0]; n]]))
}

pub fn sigmoid(x: &TensorRef) -> TensorRef {
    let (x_data, x_shape) = {
        let g = x.lock();
        (g.data.clone(), g.shape.clone())
    };
    let y: Vec<f64> = x_data.iter().map(|v| 1.0 / (1.0 + (-v).exp())).collect();
    let yc = y.clone();
    node(y, x_shape, vec![x.clone()], Box::new(move |g| {
        vec![g.iter().zip(yc.iter()).map(|(gi, yi)| gi * yi * (1.0 - yi)).collect()]
    }))
}

pub fn relu(x: &TensorRef) -> TensorRef {
    let (x_data, x_shape) = {
        let g = x.lock();
        (g.data.clone(), g.shape.clone())
    };
    let data: Vec<f64> = x_data.iter().map(|v| v.max(0.0)).collect();
    let xd = x_data.clone();
    node(data, x_shape, vec![x.clone()], Box::new(move |g| {
        vec![g.iter().zip(xd.iter()).map(|(gi, xi)| if *xi > 0.0 { *gi } else { 0.0 }).collect()]
    }))
}

/// `softmax(x, causal?)`, row-wise over a `[rows, cols]` tensor.
pub fn softmax(x: &TensorRef, causal: bool) -> TensorRef {
    let (x_data, x_shape) = {
        let g = x.lock();
        (g.data.clone(), g.shape.clone())
    };
    let rows = x_shape[0];
    let cols = *x_shape.get(1).unwrap_or(&1);
    let mut y = vec![0.0; rows * cols];
    for r in 0..rows {
        let row = &x_data[r * cols..(r + 1) * cols];
        let limit = if causal { r + 1 } else { cols };
        let max = row[..limit].iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let mut denom = 0.0;
        let mut exps = vec![0.0; cols];
        for c in 0..limit {
            let e = (row[c] - max).exp();
            exps[c] = e;
            denom += e;
        }
        for c in 0..cols {
            y[r * cols + c] = if c < limit { exps[c] / denom } else { 0.0 };
        }
    }
    let yc = y.clone();
    node(y, x_shape, vec![x.clone()], Box::new(move |g| {
        let mut out = vec![0.0; rows * cols];
        for r in 0..rows {
            let y_row = &yc[r * cols..(r + 1) * cols];
            let g_row = &g[r * cols..(r + 1) * cols];
            let dot: f64 = y_row.iter().zip(g_row.iter()).map(|(y, g)| y * g).sum();
            for c in 0..cols {
                out[r * cols + c] = (g_row[c] - dot) * y_row[c];
            }
        }
        vec![out]
    }))
}

/// `cross-entropy-loss(logits, target)` (§4.10): mean negative
/// log-probability of the one-hot target class per row.
pub fn cross_entropy_loss(logits: &TensorRef, target: &TensorRef) -> TensorRef {
    let (logits_data, shape) = {
        let g = logits.lock();
        (g.data.clone(), g.shape.clone())
    };
    let target_data = target.lock().data.clone();
    let rows = shape[0];
    let cols = *shape.get(1).unwrap_or(&1);
    let mut probs = vec![0.0; rows * cols];
    let mut loss = 0.0;
    for r in 0..rows {
        let row = &logits_data[r * cols..(r + 1) * cols];
        let max = row.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let mut denom = 0.0;
        for c in 0..cols {
            let e = (row[c] - max).exp();
            probs[r * cols + c] = e;
            denom += e;
        }
        for c in 0..cols {
            probs[r * cols + c] /= denom;
        }
        let target_row = &target_data[r * cols..(r + 1) * cols];
        let p_true: f64 = (0..cols).map(|c| if target_row[c] > 0.5 { probs[r * cols + c] } else { 0.0 }).sum();
        loss += -(p_true.max(1e-12)).ln();
    }
    loss /= rows as f64;
    let probs_c = probs.clone();
    let target_c = target_data.clone();
    node(vec![loss], vec![1], vec![logits.clone()], Box::new(move |g| {
        let scale = g[0] / rows as f64;
        let grad: Vec<f64> = probs_c.iter().zip(target_c.iter()).map(|(p, t)| (p - t) * scale).collect();
        vec![grad]
    }))
}

/// `layer-norm(x, gain, bias)` (§4.10): row-wise mean-0/var-1 (epsilon
/// `1e-5`) then affine-scaled.
pub fn layer_norm(x: &TensorRef, gain: &TensorRef, bias: &TensorRef) -> TensorRef {
    const EPS: f64 = 1e-5;
    let (x_data, shape) = {
        let g = x.lock();
        (g.data.clone(), g.shape.clone())
    };
    let gain_data = gain.lock().data.clone();
    let bias_data = bias.lock().data.clone();
    let rows = shape[0];
    let cols = *shape.get(1).unwrap_or(&1);
    let mut normed = vec![0.0; rows * cols];
    let mut stds = vec![0.0; rows];
    let mut means = vec![0.0; rows];
    for r in 0..rows {
        let row = &x_data[r * cols..(r + 1) * cols];
        let mean: f64 = row.iter().sum::<f64>() / cols as f64;
        let var: f64 = row.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / cols as f64;
        let std = (var + EPS).sqrt();
        means[r] = mean;
        stds[r] = std;
        for c in 0..cols {
            normed[r * cols + c] = (row[c] - mean) / std;
        }
    }
    let mut out = vec![0.0; rows * cols];
    for r in 0..rows {
        for c in 0..cols {
            out[r * cols + c] = normed[r * cols + c] * gain_data[c] + bias_data[c];
        }
    }
    let normed_c = normed.clone();
    let gain_c = gain_data.clone();
    let cols_ = cols;
    let rows_ = rows;
    node(out, shape.clone(), vec![x.clone(), gain.clone(), bias.clone()], Box::new(move |g| {
        let mut dgain = vec![0.0; cols_];
        let mut dbias = vec![0.0; cols_];
        for r in 0..rows_ {
            for c in 0..cols_ {
                dgain[c] += g[r * cols_ + c] * normed_c[r * cols_ + c];
                dbias[c] += g[r * cols_ + c];
            }
        }
        // full input gradient including the mean/variance correction
        // terms: dxhat_i = g_i * gain_i; dx_i = (dxhat_i - mean(dxhat) -
        // xhat_i * mean(dxhat .* xhat)) / std.
        let mut dx = vec![0.0; rows_ * cols_];
        for r in 0..rows_ {
            let row_dxhat: Vec<f64> = (0..cols_).map(|c| g[r * cols_ + c] * gain_c[c]).collect();
            let sum_dxhat: f64 = row_dxhat.iter().sum();
            let sum_dxhat_xhat: f64 = (0..cols_).map(|c| row_dxhat[c] * normed_c[r * cols_ + c]).sum();
            for c in 0..cols_ {
                let xhat = normed_c[r * cols_ + c];
                dx[r * cols_ + c] =
                    (row_dxhat[c] - sum_dxhat / cols_ as f64 - xhat * sum_dxhat_xhat / cols_ as f64) / stds[r];
            }
        }
        vec![dx, dgain, dbias]
    }))
}

/// `conv2d(input, kernel, bias, stride, padding)` over
/// `input: [H, W]`, `kernel: [KH, KW]` (single channel, matching the
/// other ops' 2-D convention).
pub fn conv2d(input: &TensorRef, kernel: &TensorRef, bias: &TensorRef, stride: usize, padding: usize) -> TensorRef {
    let (in_data, in_shape) = {
        let g = input.lock();
        (g.data.clone(), g.shape.clone())
    };
    let (k_data, k_shape) = {
        let g = kernel.lock();
        (g.data.clone(), g.shape.clone())
    };
    let bias_val = bias.lock().data.first().copied().unwrap_or(0.0);
    let (h, w) = (in_shape[0], in_shape[1]);
    let (kh, kw) = (k_shape[0], k_shape[1]);
    let padded_h = h + 2 * padding;
    let padded_w = w + 2 * padding;
    let out_h = (padded_h - kh) / stride + 1;
    let out_w = (padded_w - kw) / stride + 1;
    let get = |r: isize, c: isize| -> f64 {
        let (ir, ic) = (r - padding as isize, c - padding as isize);
        if ir < 0 || ic < 0 || ir as usize >= h || ic as usize >= w {
            0.0
        } else {
            in_data[ir as usize * w + ic as usize]
        }
    };
    let mut out = vec![0.0; out_h * out_w];
    for oy in 0..out_h {
        for ox in 0..out_w {
            let mut acc = bias_val;
            for ky in 0..kh {
                for kx in 0..kw {
                    let r = (oy * stride + ky) as isize;
                    let c = (ox * stride + kx) as isize;
                    acc += get(r, c) * k_data[ky * kw + kx];
                }
            }
            out[oy * out_w + ox] = acc;
        }
    }
    let (in_d, k_d) = (in_data.clone(), k_data.clone());
    node(out, vec![out_h, out_w], vec![input.clone(), kernel.clone(), bias.clone()], Box::new(move |g| {
        let mut d_input = vec![0.0; h * w];
        let mut d_kernel = vec![0.0; kh * kw];
        let mut d_bias = 0.0;
        for oy in 0..out_h {
            for ox in 0..out_w {
                let go = g[oy * out_w + ox];
                d_bias += go;
                for ky in 0..kh {
                    for kx in 0..kw {
                        let r = oy * stride + ky;
                        let c = ox * stride + kx;
                        if r >= padding && c >= padding {
                            let (ir, ic) = (r - padding, c - padding);
                            if ir < h && ic < w {
                                d_input[ir * w + ic] += go * k_d[ky * kw + kx];
                                d_kernel[ky * kw + kx] += go * in_d[ir * w + ic];
                            }
                        }
                    }
                }
            }
        }
        vec![d_input, d_kernel, vec![d_bias]]
    }))
}

/// `maxpool2d(input, pool, stride)` over `input: [H, W]`.
pub fn maxpool2d(input: &TensorRef, pool: usize, stride: usize) -> TensorRef {
    let (in_data, in_shape) = {
        let g = input.lock();
        (g.data.clone(), g.shape.clone())
    };
    let (h, w) = (in_shape[0], in_shape[1]);
    let out_h = (h - pool) / stride + 1;
    let out_w = (w - pool) / stride + 1;
    let mut out = vec![0.0; out_h * out_w];
    let mut argmax = vec![0usize; out_h * out_w];
    for oy in 0..out_h {
        for ox in 0..out_w {
            let mut best = f64::NEG_INFINITY;
            let mut best_idx = 0;
            for py in 0..pool {
                for px in 0..pool {
                    let r = oy * stride + py;
                    let c = ox * stride + px;
                    let idx = r * w + c;
                    if in_data[idx] > best {
                        best = in_data[idx];
                        best_idx = idx;
                    }
                }
            }
            out[oy * out_w + ox] = best;
            argmax[oy * out_w + ox] = best_idx;
        }
    }
    let n = h * w;
    node(out, vec![out_h, out_w], vec![input.clone()], Box::new(move |g| {
        let mut d_input = vec![0.0; n];
        for (i, &idx) in argmax.iter().enumerate() {
            d_input[idx] += g[i];
        }
        vec![d_input]
    }))
}

/// `backward(loss)` (§4.10): topologically sort the graph reachable from
/// `loss`, seed its gradient with ones, and propagate in reverse order.
/// Non-leaf tensors drop their gradient afterward; leaves retain theirs.
pub fn backward(loss: &TensorRef) {
    let mut order = vec![];
    let mut visited = HashSet::new();
    topo_sort(loss, &mut visited, &mut order);

    {
        let mut l = loss.lock();
        let n = l.data.len();
        l.grad = Some(vec![1.0; n]);
    }

    for t in order.iter().rev() {
        let (parents, backward_fn, grad) = {
            let guard = t.lock();
            (guard.parents.clone(), guard.backward.is_some(), guard.grad.clone())
        };
        let Some(grad) = grad else { continue };
        if !backward_fn {
            continue;
        }
        let parent_grads = {
            let guard = t.lock();
            (guard.backward.as_ref().unwrap())(&grad)
        };
        for (parent, pg) in parents.iter().zip(parent_grads.into_iter()) {
            let mut p = parent.lock();
            match &mut p.grad {
                Some(existing) => {
                    for (e, g) in existing.iter_mut().zip(pg.iter()) {
                        *e += g;
                    }
                }
                None => p.grad = Some(pg),
            }
        }
    }

    for t in &order {
        let mut guard = t.lock();
        if guard.backward.is_some() {
            guard.grad = None;
        }
    }
}

fn topo_sort(t: &TensorRef, visited: &mut HashSet<usize>, order: &mut Vec<TensorRef>) {
    let key = Arc::as_ptr(t) as usize;
    if visited.contains(&key) {
        return;
    }
    visited.insert(key);
    let parents = t.lock().parents.clone();
    for p in &parents {
        topo_sort(p, visited, order);
    }
    order.push(t.clone());
}

#[cfg(test)]
mod test {
    use super::*;

    /// Central-difference estimate of d(sum(forward(x)))/dx_i for every
    /// element of `x`, used to check `backward`'s analytic gradient
    /// against the §8 finite-difference invariant (max abs error <= 1e-4).
    fn central_diff<F: Fn(&[f64]) -> TensorRef>(x: &[f64], forward: F) -> Vec<f64> {
        const H: f64 = 1e-5;
        let scalar = |data: &[f64]| -> f64 { forward(data).lock().data.iter().sum() };
        x.iter()
            .enumerate()
            .map(|(i, _)| {
                let mut plus = x.to_vec();
                plus[i] += H;
                let mut minus = x.to_vec();
                minus[i] -= H;
                (scalar(&plus) - scalar(&minus)) / (2.0 * H)
            })
            .collect()
    }

    fn assert_close(analytic: &[f64], numeric: &[f64]) {
        for (a, n) in analytic.iter().zip(numeric.iter()) {
            assert!((a - n).abs() <= 1e-4, "analytic {a} vs numeric {n} diverge by {}", (a - n).abs());
        }
    }

    #[test]
    fn sigmoid_gradient_matches_finite_difference() {
        let data = vec![-1.5, 0.0, 0.5, 2.0];
        let shape = vec![4];
        let x = leaf(data.clone(), shape.clone());
        let y = sigmoid(&x);
        backward(&y);
        let analytic = x.lock().grad.clone().unwrap();
        let numeric = central_diff(&data, |d| sigmoid(&leaf(d.to_vec(), shape.clone())));
        assert_close(&analytic, &numeric);
    }

    #[test]
    fn relu_gradient_matches_finite_difference_away_from_kink() {
        let data = vec![-2.0, 3.0, 1.0, -0.5];
        let shape = vec![4];
        let x = leaf(data.clone(), shape.clone());
        let y = relu(&x);
        backward(&y);
        let analytic = x.lock().grad.clone().unwrap();
        let numeric = central_diff(&data, |d| relu(&leaf(d.to_vec(), shape.clone())));
        assert_close(&analytic, &numeric);
    }

    #[test]
    fn matmul_gradient_matches_finite_difference() {
        let a_data = vec![1.0, 2.0, 3.0, 4.0];
        let a_shape = vec![2, 2];
        let b = leaf(vec![5.0, 6.0, 7.0, 8.0], vec![2, 2]);
        let a = leaf(a_data.clone(), a_shape.clone());
        let y = matmul(&a, &b);
        backward(&y);
        let analytic = a.lock().grad.clone().unwrap();
        let b_clone = b.clone();
        let numeric = central_diff(&a_data, |d| matmul(&leaf(d.to_vec(), a_shape.clone()), &b_clone));
        assert_close(&analytic, &numeric);
    }

    #[test]
    fn layer_norm_gradient_matches_finite_difference() {
        let x_data = vec![0.5, -1.0, 2.0, 0.25, 1.25, -0.75];
        let shape = vec![2, 3];
        let gain = leaf(vec![1.0, 1.0, 1.0], vec![3]);
        let bias = leaf(vec![0.0, 0.0, 0.0], vec![3]);
        let x = leaf(x_data.clone(), shape.clone());
        let y = layer_norm(&x, &gain, &bias);
        backward(&y);
        let analytic = x.lock().grad.clone().unwrap();
        let (g_clone, b_clone) = (gain.clone(), bias.clone());
        let numeric = central_diff(&x_data, |d| layer_norm(&leaf(d.to_vec(), shape.clone()), &g_clone, &b_clone));
        assert_close(&analytic, &numeric);
    }

    #[test]
    fn backward_clears_nonleaf_grad_but_keeps_leaf_grad() {
        let x = leaf(vec![2.0], vec![1]);
        let three = leaf(vec![3.0], vec![1]);
        let y = add(&mul(&x, &x), &mul(&x, &three));
        backward(&y);
        assert_eq!(x.lock().grad.clone().unwrap(), vec![7.0]);
        assert!(y.lock().grad.is_none());
    }
}
