// src/backend/cuda/kernels.rs
use crate::backend::number::{CudaNumeric, NumericKind};
use crate::error::{GraphError, Result};
use cudarc::driver::{CudaContext, CudaFunction};
use cudarc::nvrtc::{Ptx, compile_ptx};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

/// Kernel source compiled at runtime with NVRTC. Every kernel is a template
/// instantiated once per element type; the exported name carries the type suffix.
///
/// Convolution kernels share the argument block
/// `N, C, H, W, K, KH, KW, HO, WO, PH, PW, SH, SW, DH, DW, FLIP`
/// and pooling kernels `P, H, W, HO, WO, FH, FW, PH, PW, SH, SW, DH, DW, MODE`
/// (P = batch * channels, MODE 0 = max, 1 = average).
pub const KERNEL_SOURCE: &str = r#"
#define CONV_ARGS int N, int C, int H, int W, int K, int KH, int KW, int HO, int WO, \
    int PH, int PW, int SH, int SW, int DH, int DW, int FLIP
#define CONV_PASS N, C, H, W, K, KH, KW, HO, WO, PH, PW, SH, SW, DH, DW, FLIP
#define POOL_ARGS int P, int H, int W, int HO, int WO, int FH, int FW, \
    int PH, int PW, int SH, int SW, int DH, int DW, int MODE
#define POOL_PASS P, H, W, HO, WO, FH, FW, PH, PW, SH, SW, DH, DW, MODE

__device__ __forceinline__ int global_index() {
    return blockIdx.x * blockDim.x + threadIdx.x;
}

// Integer arithmetic goes through unsigned so overflow wraps like the host kernels.
template <typename T> __device__ __forceinline__ T wadd(T a, T b) { return a + b; }
template <typename T> __device__ __forceinline__ T wmul(T a, T b) { return a * b; }
template <> __device__ __forceinline__ int wadd<int>(int a, int b) {
    return (int)((unsigned int)a + (unsigned int)b);
}
template <> __device__ __forceinline__ int wmul<int>(int a, int b) {
    return (int)((unsigned int)a * (unsigned int)b);
}

template <typename T>
__device__ void add_in_place_impl(T alpha, const T* x, T beta, T* out, int n) {
    int i = global_index();
    if (i >= n) return;
    out[i] = (beta == T(0)) ? wmul(alpha, x[i]) : wadd(wmul(alpha, x[i]), wmul(beta, out[i]));
}

template <typename T>
__device__ void fill_impl(T* out, T value, int n) {
    int i = global_index();
    if (i < n) out[i] = value;
}

template <typename T>
__device__ void broadcast_scalar_impl(const T* src, T alpha, T* out, int n) {
    int i = global_index();
    if (i < n) out[i] = wmul(alpha, src[0]);
}

// Single block of 256 threads.
template <typename T>
__device__ void sum_all_impl(const T* x, T* out, int n) {
    __shared__ T partial[256];
    T acc = T(0);
    for (int i = threadIdx.x; i < n; i += blockDim.x) acc = wadd(acc, x[i]);
    partial[threadIdx.x] = acc;
    __syncthreads();
    for (int s = blockDim.x / 2; s > 0; s >>= 1) {
        if (threadIdx.x < s) partial[threadIdx.x] = wadd(partial[threadIdx.x], partial[threadIdx.x + s]);
        __syncthreads();
    }
    if (threadIdx.x == 0) out[0] = partial[0];
}

// One image: col[C*KH*KW, HO*WO].
template <typename T>
__device__ void im2col_impl(const T* x, int x_off, T* col, CONV_ARGS) {
    int idx = global_index();
    int plane = HO * WO;
    if (idx >= C * KH * KW * plane) return;
    int o = idx % plane;
    int row = idx / plane;
    int ox = o % WO, oy = o / WO;
    int kx = row % KW, ky = (row / KW) % KH, c = row / (KW * KH);
    int fy = FLIP ? KH - 1 - ky : ky;
    int fx = FLIP ? KW - 1 - kx : kx;
    int iy = oy * SH + fy * DH - PH;
    int ix = ox * SW + fx * DW - PW;
    col[idx] = (iy >= 0 && iy < H && ix >= 0 && ix < W)
        ? x[x_off + (c * H + iy) * W + ix] : T(0);
}

// Gather form of col2im: one thread per input pixel, overwrites dx.
template <typename T>
__device__ void col2im_impl(const T* col, T* dx, int dx_off, CONV_ARGS) {
    int idx = global_index();
    if (idx >= C * H * W) return;
    int ix = idx % W, iy = (idx / W) % H, c = idx / (W * H);
    T acc = T(0);
    for (int ky = 0; ky < KH; ++ky) {
        int fy = FLIP ? KH - 1 - ky : ky;
        int ny = iy + PH - fy * DH;
        if (ny < 0 || ny % SH != 0) continue;
        int oy = ny / SH;
        if (oy >= HO) continue;
        for (int kx = 0; kx < KW; ++kx) {
            int fx = FLIP ? KW - 1 - kx : kx;
            int nx = ix + PW - fx * DW;
            if (nx < 0 || nx % SW != 0) continue;
            int ox = nx / SW;
            if (ox >= WO) continue;
            int row = (c * KH + ky) * KW + kx;
            acc += col[row * HO * WO + oy * WO + ox];
        }
    }
    dx[dx_off + idx] = acc;
}

template <typename T>
__device__ void conv2d_fwd_direct_impl(const T* x, const T* w, T* y, CONV_ARGS) {
    int idx = global_index();
    if (idx >= N * K * HO * WO) return;
    int ox = idx % WO, oy = (idx / WO) % HO, k = (idx / (WO * HO)) % K, n = idx / (WO * HO * K);
    T acc = T(0);
    for (int c = 0; c < C; ++c) {
        for (int ky = 0; ky < KH; ++ky) {
            int fy = FLIP ? KH - 1 - ky : ky;
            int iy = oy * SH + fy * DH - PH;
            if (iy < 0 || iy >= H) continue;
            for (int kx = 0; kx < KW; ++kx) {
                int fx = FLIP ? KW - 1 - kx : kx;
                int ix = ox * SW + fx * DW - PW;
                if (ix < 0 || ix >= W) continue;
                acc += w[((k * C + c) * KH + ky) * KW + kx] * x[((n * C + c) * H + iy) * W + ix];
            }
        }
    }
    y[idx] = acc;
}

template <typename T>
__device__ void conv2d_bwd_data_direct_impl(const T* w, const T* dy, T* dx, CONV_ARGS) {
    int idx = global_index();
    if (idx >= N * C * H * W) return;
    int ix = idx % W, iy = (idx / W) % H, c = (idx / (W * H)) % C, n = idx / (W * H * C);
    T acc = T(0);
    for (int k = 0; k < K; ++k) {
        for (int ky = 0; ky < KH; ++ky) {
            int fy = FLIP ? KH - 1 - ky : ky;
            int ny = iy + PH - fy * DH;
            if (ny < 0 || ny % SH != 0) continue;
            int oy = ny / SH;
            if (oy >= HO) continue;
            for (int kx = 0; kx < KW; ++kx) {
                int fx = FLIP ? KW - 1 - kx : kx;
                int nx = ix + PW - fx * DW;
                if (nx < 0 || nx % SW != 0) continue;
                int ox = nx / SW;
                if (ox >= WO) continue;
                acc += w[((k * C + c) * KH + ky) * KW + kx] * dy[((n * K + k) * HO + oy) * WO + ox];
            }
        }
    }
    dx[idx] = acc;
}

template <typename T>
__device__ void conv2d_bwd_filter_direct_impl(const T* x, const T* dy, T* dw, CONV_ARGS) {
    int idx = global_index();
    if (idx >= K * C * KH * KW) return;
    int kx = idx % KW, ky = (idx / KW) % KH, c = (idx / (KW * KH)) % C, k = idx / (KW * KH * C);
    int fy = FLIP ? KH - 1 - ky : ky;
    int fx = FLIP ? KW - 1 - kx : kx;
    T acc = T(0);
    for (int n = 0; n < N; ++n) {
        for (int oy = 0; oy < HO; ++oy) {
            int iy = oy * SH + fy * DH - PH;
            if (iy < 0 || iy >= H) continue;
            for (int ox = 0; ox < WO; ++ox) {
                int ix = ox * SW + fx * DW - PW;
                if (ix < 0 || ix >= W) continue;
                acc += dy[((n * K + k) * HO + oy) * WO + ox] * x[((n * C + c) * H + iy) * W + ix];
            }
        }
    }
    dw[idx] = acc;
}

template <typename T>
__device__ void pool2d_fwd_impl(const T* x, T* y, int* pos, POOL_ARGS) {
    int idx = global_index();
    if (idx >= P * HO * WO) return;
    int ox = idx % WO, oy = (idx / WO) % HO, p = idx / (WO * HO);
    T best = T(0);
    T sum = T(0);
    int winner = -1;
    for (int ky = 0; ky < FH; ++ky) {
        int iy = oy * SH + ky * DH - PH;
        if (iy < 0 || iy >= H) continue;
        for (int kx = 0; kx < FW; ++kx) {
            int ix = ox * SW + kx * DW - PW;
            if (ix < 0 || ix >= W) continue;
            int xi = (p * H + iy) * W + ix;
            T v = x[xi];
            if (MODE == 0) {
                if (winner < 0 || v > best) { best = v; winner = xi; }
            } else {
                sum += v;
            }
        }
    }
    if (MODE == 0) {
        y[idx] = winner < 0 ? T(0) : best;
        pos[idx] = winner;
    } else {
        y[idx] = sum / T(FH * FW);
        pos[idx] = -1;
    }
}

// Gather form: one thread per input element, overwrites dx.
template <typename T>
__device__ void pool2d_bwd_impl(const T* dy, const int* pos, T* dx, POOL_ARGS) {
    int idx = global_index();
    if (idx >= P * H * W) return;
    int ix = idx % W, iy = (idx / W) % H, p = idx / (W * H);
    T acc = T(0);
    for (int ky = 0; ky < FH; ++ky) {
        int ny = iy + PH - ky * DH;
        if (ny < 0 || ny % SH != 0) continue;
        int oy = ny / SH;
        if (oy >= HO) continue;
        for (int kx = 0; kx < FW; ++kx) {
            int nx = ix + PW - kx * DW;
            if (nx < 0 || nx % SW != 0) continue;
            int ox = nx / SW;
            if (ox >= WO) continue;
            int o = (p * HO + oy) * WO + ox;
            if (MODE == 0) {
                if (pos[o] == idx) acc += dy[o];
            } else {
                acc += dy[o] / T(FH * FW);
            }
        }
    }
    dx[idx] = acc;
}

#define INSTANTIATE(T, S) \
extern "C" __global__ void add_in_place_##S(T alpha, const T* x, T beta, T* out, int n) { \
    add_in_place_impl<T>(alpha, x, beta, out, n); } \
extern "C" __global__ void fill_##S(T* out, T value, int n) { fill_impl<T>(out, value, n); } \
extern "C" __global__ void broadcast_scalar_##S(const T* src, T alpha, T* out, int n) { \
    broadcast_scalar_impl<T>(src, alpha, out, n); } \
extern "C" __global__ void sum_all_##S(const T* x, T* out, int n) { sum_all_impl<T>(x, out, n); } \
extern "C" __global__ void im2col_##S(const T* x, int x_off, T* col, CONV_ARGS) { \
    im2col_impl<T>(x, x_off, col, CONV_PASS); } \
extern "C" __global__ void col2im_##S(const T* col, T* dx, int dx_off, CONV_ARGS) { \
    col2im_impl<T>(col, dx, dx_off, CONV_PASS); } \
extern "C" __global__ void conv2d_fwd_direct_##S(const T* x, const T* w, T* y, CONV_ARGS) { \
    conv2d_fwd_direct_impl<T>(x, w, y, CONV_PASS); } \
extern "C" __global__ void conv2d_bwd_data_direct_##S(const T* w, const T* dy, T* dx, CONV_ARGS) { \
    conv2d_bwd_data_direct_impl<T>(w, dy, dx, CONV_PASS); } \
extern "C" __global__ void conv2d_bwd_filter_direct_##S(const T* x, const T* dy, T* dw, CONV_ARGS) { \
    conv2d_bwd_filter_direct_impl<T>(x, dy, dw, CONV_PASS); } \
extern "C" __global__ void pool2d_fwd_##S(const T* x, T* y, int* pos, POOL_ARGS) { \
    pool2d_fwd_impl<T>(x, y, pos, POOL_PASS); } \
extern "C" __global__ void pool2d_bwd_##S(const T* dy, const int* pos, T* dx, POOL_ARGS) { \
    pool2d_bwd_impl<T>(dy, pos, dx, POOL_PASS); }

INSTANTIATE(float, f32)
INSTANTIATE(double, f64)
INSTANTIATE(int, i32)
"#;

/// Base names of the exported kernels, without the type suffix.
pub const KERNEL_NAMES: &[&str] = &[
    "add_in_place",
    "fill",
    "broadcast_scalar",
    "sum_all",
    "im2col",
    "col2im",
    "conv2d_fwd_direct",
    "conv2d_bwd_data_direct",
    "conv2d_bwd_filter_direct",
    "pool2d_fwd",
    "pool2d_bwd",
];

const KINDS: [NumericKind; 3] = [NumericKind::Int32, NumericKind::Float32, NumericKind::Float64];

// NVRTC is slow, the source is compiled once per process and shared by every context.
static COMPILED_PTX: OnceLock<std::result::Result<Ptx, String>> = OnceLock::new();

fn compiled_ptx() -> Result<Ptx> {
    COMPILED_PTX
        .get_or_init(|| compile_ptx(KERNEL_SOURCE).map_err(|e| e.to_string()))
        .clone()
        .map_err(|e| GraphError::device(format!("NVRTC compilation failed: {e}")))
}

/// Loaded kernel functions keyed by their full (suffixed) name.
pub struct KernelManager {
    functions: HashMap<String, CudaFunction>,
}

impl KernelManager {
    pub fn load(ctx: &Arc<CudaContext>) -> Result<Self> {
        let module = ctx
            .load_module(compiled_ptx()?)
            .map_err(|e| GraphError::device(format!("failed to load kernel module: {e}")))?;

        let mut functions = HashMap::new();
        for base in KERNEL_NAMES {
            for kind in KINDS {
                let name = format!("{base}_{}", kind.suffix());
                let func = module
                    .load_function(&name)
                    .map_err(|e| GraphError::device(format!("kernel {name} not found: {e}")))?;
                functions.insert(name, func);
            }
        }
        tracing::debug!(count = functions.len(), "CUDA kernels loaded");
        Ok(Self { functions })
    }

    /// Instantiation of `base` for the element type `T`.
    pub fn function<T: CudaNumeric>(&self, base: &str) -> Result<&CudaFunction> {
        let name = format!("{base}_{}", T::KIND.suffix());
        self.functions
            .get(&name)
            .ok_or_else(|| GraphError::device(format!("kernel {name} not loaded")))
    }
}
