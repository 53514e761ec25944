// src/backend/cuda/ops.rs
use super::kernels::KernelManager;
use super::workspace::ConvWorkspace;
use crate::backend::CudaNumeric;
use crate::backend::storage::CUDAStorage;
use crate::error::{GraphError, Result};
use crate::math::{ConvGeometry, PoolGeometry, PoolingMode};
use cudarc::cublas::sys::cublasOperation_t;
use cudarc::cublas::{CudaBlas, GemmConfig};
use cudarc::driver::{
    CudaSlice, CudaStream, DevicePtr, DevicePtrMut, DeviceSlice, LaunchConfig, PushKernelArg,
};
use std::marker::PhantomData;
use std::sync::Arc;

const REDUCE_BLOCK: u32 = 256;

// Generic kernel launch: resolves the `T` instantiation and pushes the arguments in order.
macro_rules! launch_kernel {
    ($self:expr, $name:expr, $cfg:expr, $( $arg:expr ),* $(,)? ) => {{
        let func = $self.kernels.function::<T>($name)?;
        // Safety: argument order and types follow the kernel signature in KERNEL_SOURCE.
        unsafe {
            $self
                .stream
                .launch_builder(func)
                $( .arg($arg) )*
                .launch($cfg)
        }
        .map(|_| ())
        .map_err(|e| GraphError::device(format!("failed to launch {}: {e}", $name)))
    }};
}

fn to_i32(value: usize, what: &str) -> Result<i32> {
    i32::try_from(value)
        .map_err(|_| GraphError::invalid(format!("{what} ({value}) exceeds the 32-bit kernel index range")))
}

/// Convolution argument block shared by the conv kernels.
fn conv_args(g: &ConvGeometry) -> Result<[i32; 16]> {
    let p = &g.params;
    to_i32(g.batch * g.in_channels * g.in_h * g.in_w, "input size")?;
    to_i32(g.batch * g.out_channels * g.out_h * g.out_w, "output size")?;
    to_i32(g.col_rows() * g.col_cols(), "column matrix size")?;
    let values = [
        g.batch,
        g.in_channels,
        g.in_h,
        g.in_w,
        g.out_channels,
        g.kernel_h,
        g.kernel_w,
        g.out_h,
        g.out_w,
        p.pad_h,
        p.pad_w,
        p.stride_h,
        p.stride_w,
        p.dilation_h,
        p.dilation_w,
        g.flip() as usize,
    ];
    let mut args = [0i32; 16];
    for (slot, v) in args.iter_mut().zip(values) {
        *slot = to_i32(v, "convolution parameter")?;
    }
    Ok(args)
}

fn pool_args(g: &PoolGeometry) -> Result<[i32; 14]> {
    let p = &g.params;
    to_i32(g.planes() * g.in_h * g.in_w, "pooling input size")?;
    let mode = match p.mode {
        PoolingMode::Max => 0,
        PoolingMode::Average => 1,
    };
    let values = [
        g.planes(),
        g.in_h,
        g.in_w,
        g.out_h,
        g.out_w,
        p.filter_h,
        p.filter_w,
        p.pad_h,
        p.pad_w,
        p.stride_h,
        p.stride_w,
        p.dilation_h,
        p.dilation_w,
        mode,
    ];
    let mut args = [0i32; 14];
    for (slot, v) in args.iter_mut().zip(values) {
        *slot = to_i32(v, "pooling parameter")?;
    }
    Ok(args)
}

fn op(trans: bool) -> cublasOperation_t {
    if trans {
        cublasOperation_t::CUBLAS_OP_T
    } else {
        cublasOperation_t::CUBLAS_OP_N
    }
}

/// Device kernels for one element type, queued on the context's compute stream.
pub struct CudaOps<T: CudaNumeric> {
    stream: Arc<CudaStream>,
    kernels: KernelManager,
    blas: CudaBlas,
    _marker: PhantomData<T>,
}

impl<T: CudaNumeric> CudaOps<T> {
    pub fn new(stream: Arc<CudaStream>, kernels: KernelManager) -> Result<Self> {
        let blas = CudaBlas::new(stream.clone())
            .map_err(|e| GraphError::device(format!("cuBLAS init failed: {e}")))?;
        Ok(Self {
            stream,
            kernels,
            blas,
            _marker: PhantomData,
        })
    }

    pub fn stream(&self) -> &Arc<CudaStream> {
        &self.stream
    }

    /// `out = alpha * x + beta * out`.
    pub fn add_in_place(
        &self,
        alpha: T,
        x: &CUDAStorage<T>,
        beta: T,
        out: &mut CUDAStorage<T>,
    ) -> Result<()> {
        let len = x.data().len();
        let n = to_i32(len, "tensor size")?;
        let cfg = LaunchConfig::for_num_elems(len as u32);
        launch_kernel!(self, "add_in_place", cfg, &alpha, x.data(), &beta, out.data_mut(), &n)
    }

    pub fn fill(&self, value: T, out: &mut CudaSlice<T>) -> Result<()> {
        let len = out.len();
        let n = to_i32(len, "tensor size")?;
        let cfg = LaunchConfig::for_num_elems(len as u32);
        launch_kernel!(self, "fill", cfg, out, &value, &n)
    }

    /// `out[0] = sum(x)`.
    pub fn sum_all(&self, x: &CUDAStorage<T>, out: &mut CUDAStorage<T>) -> Result<()> {
        let n = to_i32(x.data().len(), "tensor size")?;
        let cfg = LaunchConfig {
            grid_dim: (1, 1, 1),
            block_dim: (REDUCE_BLOCK, 1, 1),
            shared_mem_bytes: 0,
        };
        launch_kernel!(self, "sum_all", cfg, x.data(), out.data_mut(), &n)
    }

    /// `out[i] = alpha * src[0]`.
    pub fn broadcast_scalar(
        &self,
        alpha: T,
        src: &CUDAStorage<T>,
        out: &mut CUDAStorage<T>,
    ) -> Result<()> {
        let len = out.data().len();
        let n = to_i32(len, "tensor size")?;
        let cfg = LaunchConfig::for_num_elems(len as u32);
        launch_kernel!(self, "broadcast_scalar", cfg, src.data(), &alpha, out.data_mut(), &n)
    }

    /// Row-major `C[m, n] = alpha * op(A) * op(B) + beta * C` on column-major cuBLAS.
    ///
    /// A row-major buffer read as column-major is its transpose, so the product is
    /// computed as `C^T = op(B)^T * op(A)^T`: operands and flags are swapped and the
    /// result lands in row-major order without any physical transposition.
    #[allow(clippy::too_many_arguments)]
    pub fn gemm<A, B, C>(
        &self,
        alpha: T,
        trans_a: bool,
        a: &A,
        trans_b: bool,
        b: &B,
        beta: T,
        c: &mut C,
        (m, n, k): (usize, usize, usize),
    ) -> Result<()>
    where
        A: DevicePtr<T>,
        B: DevicePtr<T>,
        C: DevicePtrMut<T>,
    {
        if !T::KIND.is_float() {
            return Err(GraphError::Unsupported(format!(
                "GEMM for {} on CUDA",
                T::KIND.suffix()
            )));
        }
        let lda = if trans_a { m } else { k };
        let ldb = if trans_b { k } else { n };
        let cfg = GemmConfig {
            transa: op(trans_b),
            transb: op(trans_a),
            m: to_i32(n, "gemm n")?,
            n: to_i32(m, "gemm m")?,
            k: to_i32(k, "gemm k")?,
            alpha,
            lda: to_i32(ldb, "gemm ldb")?,
            ldb: to_i32(lda, "gemm lda")?,
            beta,
            ldc: to_i32(n, "gemm ldc")?,
        };
        T::gemm(&self.blas, cfg, b, a, c).map_err(GraphError::device)
    }

    fn im2col(
        &self,
        x: &CudaSlice<T>,
        offset: usize,
        col: &mut CudaSlice<T>,
        g: &ConvGeometry,
        args: &[i32; 16],
    ) -> Result<()> {
        let func = self.kernels.function::<T>("im2col")?;
        let x_off = to_i32(offset, "image offset")?;
        let cfg = LaunchConfig::for_num_elems((g.col_rows() * g.col_cols()) as u32);
        let mut builder = self.stream.launch_builder(func);
        builder.arg(x).arg(&x_off).arg(col);
        for v in args.iter() {
            builder.arg(v);
        }
        // Safety: arguments follow the im2col signature.
        unsafe { builder.launch(cfg) }
            .map(|_| ())
            .map_err(|e| GraphError::device(format!("failed to launch im2col: {e}")))
    }

    fn col2im(
        &self,
        col: &CudaSlice<T>,
        dx: &mut CudaSlice<T>,
        offset: usize,
        g: &ConvGeometry,
        args: &[i32; 16],
    ) -> Result<()> {
        let func = self.kernels.function::<T>("col2im")?;
        let dx_off = to_i32(offset, "image offset")?;
        let cfg = LaunchConfig::for_num_elems(g.input_image_len() as u32);
        let mut builder = self.stream.launch_builder(func);
        builder.arg(col).arg(dx).arg(&dx_off);
        for v in args.iter() {
            builder.arg(v);
        }
        // Safety: arguments follow the col2im signature.
        unsafe { builder.launch(cfg) }
            .map(|_| ())
            .map_err(|e| GraphError::device(format!("failed to launch col2im: {e}")))
    }

    /// Direct convolution kernel: three buffers followed by the geometry block.
    fn launch_direct(
        &self,
        name: &str,
        a: &CudaSlice<T>,
        b: &CudaSlice<T>,
        out: &mut CudaSlice<T>,
        threads: usize,
        args: &[i32; 16],
    ) -> Result<()> {
        let func = self.kernels.function::<T>(name)?;
        let cfg = LaunchConfig::for_num_elems(threads as u32);
        let mut builder = self.stream.launch_builder(func);
        builder.arg(a).arg(b).arg(out);
        for v in args.iter() {
            builder.arg(v);
        }
        // Safety: every direct convolution kernel takes (in, in, out, CONV_ARGS).
        unsafe { builder.launch(cfg) }
            .map(|_| ())
            .map_err(|e| GraphError::device(format!("failed to launch {name}: {e}")))
    }

    /// Forward convolution. With a workspace each image is unfolded and multiplied by
    /// the filter matrix; without one the direct kernel is used.
    pub fn conv2d(
        &self,
        x: &CUDAStorage<T>,
        w: &CUDAStorage<T>,
        y: &mut CUDAStorage<T>,
        g: &ConvGeometry,
        workspace: Option<&mut ConvWorkspace<T>>,
    ) -> Result<()> {
        let args = conv_args(g)?;
        let Some(ws) = workspace else {
            let threads = g.batch * g.output_image_len();
            return self.launch_direct(
                "conv2d_fwd_direct",
                x.data(),
                w.data(),
                y.data_mut(),
                threads,
                &args,
            );
        };

        let (rows, cols) = (g.col_rows(), g.col_cols());
        let (in_len, out_len) = (g.input_image_len(), g.output_image_len());
        for n in 0..g.batch {
            self.im2col(x.data(), n * in_len, &mut ws.forward, g, &args)?;
            let mut y_n = y.data_mut().slice_mut(n * out_len..(n + 1) * out_len);
            self.gemm(
                T::one(),
                false,
                w.data(),
                false,
                &ws.forward,
                T::zero(),
                &mut y_n,
                (g.out_channels, cols, rows),
            )?;
        }
        Ok(())
    }

    /// Gradient w.r.t. the convolution input.
    pub fn conv2d_grad_data(
        &self,
        w: &CUDAStorage<T>,
        dy: &CUDAStorage<T>,
        dx: &mut CUDAStorage<T>,
        g: &ConvGeometry,
        workspace: Option<&mut ConvWorkspace<T>>,
    ) -> Result<()> {
        let args = conv_args(g)?;
        let Some(ws) = workspace else {
            let threads = g.batch * g.input_image_len();
            return self.launch_direct(
                "conv2d_bwd_data_direct",
                w.data(),
                dy.data(),
                dx.data_mut(),
                threads,
                &args,
            );
        };

        let (rows, cols) = (g.col_rows(), g.col_cols());
        let (in_len, out_len) = (g.input_image_len(), g.output_image_len());
        for n in 0..g.batch {
            let dy_n = dy.data().slice(n * out_len..(n + 1) * out_len);
            self.gemm(
                T::one(),
                true,
                w.data(),
                false,
                &dy_n,
                T::zero(),
                &mut ws.grad_data,
                (rows, cols, g.out_channels),
            )?;
            self.col2im(&ws.grad_data, dx.data_mut(), n * in_len, g, &args)?;
        }
        Ok(())
    }

    /// Gradient w.r.t. the filter, accumulated over the batch.
    pub fn conv2d_grad_filter(
        &self,
        x: &CUDAStorage<T>,
        dy: &CUDAStorage<T>,
        dw: &mut CUDAStorage<T>,
        g: &ConvGeometry,
        workspace: Option<&mut ConvWorkspace<T>>,
    ) -> Result<()> {
        let args = conv_args(g)?;
        let Some(ws) = workspace else {
            let threads = g.out_channels * g.col_rows();
            return self.launch_direct(
                "conv2d_bwd_filter_direct",
                x.data(),
                dy.data(),
                dw.data_mut(),
                threads,
                &args,
            );
        };

        let (rows, cols) = (g.col_rows(), g.col_cols());
        let (in_len, out_len) = (g.input_image_len(), g.output_image_len());
        for n in 0..g.batch {
            self.im2col(x.data(), n * in_len, &mut ws.grad_filter, g, &args)?;
            let dy_n = dy.data().slice(n * out_len..(n + 1) * out_len);
            let beta = if n == 0 { T::zero() } else { T::one() };
            self.gemm(
                T::one(),
                false,
                &dy_n,
                true,
                &ws.grad_filter,
                beta,
                dw.data_mut(),
                (g.out_channels, rows, cols),
            )?;
        }
        Ok(())
    }

    pub fn pooling(
        &self,
        x: &CUDAStorage<T>,
        y: &mut CUDAStorage<T>,
        positions: &mut CUDAStorage<i32>,
        g: &PoolGeometry,
    ) -> Result<()> {
        let args = pool_args(g)?;
        let func = self.kernels.function::<T>("pool2d_fwd")?;
        let cfg = LaunchConfig::for_num_elems((g.planes() * g.out_h * g.out_w) as u32);
        let mut builder = self.stream.launch_builder(func);
        builder.arg(x.data()).arg(y.data_mut()).arg(positions.data_mut());
        for v in args.iter() {
            builder.arg(v);
        }
        // Safety: arguments follow the pool2d_fwd signature.
        unsafe { builder.launch(cfg) }
            .map(|_| ())
            .map_err(|e| GraphError::device(format!("failed to launch pool2d_fwd: {e}")))
    }

    pub fn pooling_grad(
        &self,
        dy: &CUDAStorage<T>,
        positions: &CUDAStorage<i32>,
        dx: &mut CUDAStorage<T>,
        g: &PoolGeometry,
    ) -> Result<()> {
        let args = pool_args(g)?;
        let func = self.kernels.function::<T>("pool2d_bwd")?;
        let cfg = LaunchConfig::for_num_elems((g.planes() * g.in_h * g.in_w) as u32);
        let mut builder = self.stream.launch_builder(func);
        builder.arg(dy.data()).arg(positions.data()).arg(dx.data_mut());
        for v in args.iter() {
            builder.arg(v);
        }
        // Safety: arguments follow the pool2d_bwd signature.
        unsafe { builder.launch(cfg) }
            .map(|_| ())
            .map_err(|e| GraphError::device(format!("failed to launch pool2d_bwd: {e}")))
    }
}
