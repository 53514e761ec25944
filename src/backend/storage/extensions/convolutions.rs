// src/backend/storage/extensions/convolutions.rs
use crate::backend::CudaNumeric;
use crate::backend::storage::CPUStorage;
use crate::error::{GraphError, Result};
use crate::math::ConvGeometry;
use ndarray::linalg::general_mat_mul;
use ndarray::{ArrayView2, ArrayViewMut2};

fn shape_err(e: ndarray::ShapeError) -> GraphError {
    GraphError::invalid(format!("convolution buffer: {e}"))
}

/// Unfolds one image `[C, H, W]` into the column matrix `[C*Kh*Kw, Ho*Wo]`.
/// Padding taps become zeros. Dilation and the filter flip of true convolution are
/// applied here, so the GEMM that follows is the same for both modes.
fn im2col<T: CudaNumeric>(image: &[T], g: &ConvGeometry, col: &mut [T]) {
    let p = &g.params;
    let cols = g.col_cols();
    for c in 0..g.in_channels {
        let plane = &image[c * g.in_h * g.in_w..(c + 1) * g.in_h * g.in_w];
        for ky in 0..g.kernel_h {
            for kx in 0..g.kernel_w {
                let row = (c * g.kernel_h + ky) * g.kernel_w + kx;
                let (fy, fx) = g.tap(ky, kx);
                for oy in 0..g.out_h {
                    let iy = (oy * p.stride_h + fy * p.dilation_h) as isize - p.pad_h as isize;
                    for ox in 0..g.out_w {
                        let ix =
                            (ox * p.stride_w + fx * p.dilation_w) as isize - p.pad_w as isize;
                        let inside = iy >= 0
                            && ix >= 0
                            && (iy as usize) < g.in_h
                            && (ix as usize) < g.in_w;
                        col[row * cols + oy * g.out_w + ox] = if inside {
                            plane[iy as usize * g.in_w + ix as usize]
                        } else {
                            T::zero()
                        };
                    }
                }
            }
        }
    }
}

/// Inverse of `im2col`: scatters the column matrix back onto one image, summing taps
/// that hit the same pixel.
fn col2im<T: CudaNumeric>(col: &[T], g: &ConvGeometry, image: &mut [T]) {
    let p = &g.params;
    let cols = g.col_cols();
    for c in 0..g.in_channels {
        let base = c * g.in_h * g.in_w;
        for ky in 0..g.kernel_h {
            for kx in 0..g.kernel_w {
                let row = (c * g.kernel_h + ky) * g.kernel_w + kx;
                let (fy, fx) = g.tap(ky, kx);
                for oy in 0..g.out_h {
                    let iy = (oy * p.stride_h + fy * p.dilation_h) as isize - p.pad_h as isize;
                    if iy < 0 || iy as usize >= g.in_h {
                        continue;
                    }
                    for ox in 0..g.out_w {
                        let ix =
                            (ox * p.stride_w + fx * p.dilation_w) as isize - p.pad_w as isize;
                        if ix < 0 || ix as usize >= g.in_w {
                            continue;
                        }
                        image[base + iy as usize * g.in_w + ix as usize] +=
                            col[row * cols + oy * g.out_w + ox];
                    }
                }
            }
        }
    }
}

impl<T: CudaNumeric> CPUStorage<T> {
    /// Forward convolution into `self` (`[N, Co, Ho, Wo]`), one GEMM per image:
    /// `Y[n] = W[Co, C*Kh*Kw] * col(X[n])`.
    pub fn conv2d_into(
        &mut self,
        input: &CPUStorage<T>,
        filter: &CPUStorage<T>,
        g: &ConvGeometry,
    ) -> Result<()> {
        let (rows, cols) = (g.col_rows(), g.col_cols());
        let (in_len, out_len) = (g.input_image_len(), g.output_image_len());
        let x = input.as_slice()?;
        let w = ArrayView2::from_shape((g.out_channels, rows), filter.as_slice()?)
            .map_err(shape_err)?;
        let y = self.as_slice_mut()?;

        let mut col = vec![T::zero(); rows * cols];
        for n in 0..g.batch {
            im2col(&x[n * in_len..(n + 1) * in_len], g, &mut col);
            let col_view = ArrayView2::from_shape((rows, cols), &col[..]).map_err(shape_err)?;
            let mut y_view = ArrayViewMut2::from_shape(
                (g.out_channels, cols),
                &mut y[n * out_len..(n + 1) * out_len],
            )
            .map_err(shape_err)?;
            y_view.fill(T::zero());
            general_mat_mul(T::one(), &w, &col_view, T::zero(), &mut y_view);
        }
        Ok(())
    }

    /// Gradient w.r.t. the input: `dcol = W^T * dY[n]`, folded back with `col2im`.
    pub fn conv2d_grad_data_into(
        &mut self,
        filter: &CPUStorage<T>,
        grad_output: &CPUStorage<T>,
        g: &ConvGeometry,
    ) -> Result<()> {
        let (rows, cols) = (g.col_rows(), g.col_cols());
        let (in_len, out_len) = (g.input_image_len(), g.output_image_len());
        let w = ArrayView2::from_shape((g.out_channels, rows), filter.as_slice()?)
            .map_err(shape_err)?;
        let dy = grad_output.as_slice()?;
        let dx = self.as_slice_mut()?;
        dx.fill(T::zero());

        let mut dcol = vec![T::zero(); rows * cols];
        for n in 0..g.batch {
            {
                let dy_view = ArrayView2::from_shape(
                    (g.out_channels, cols),
                    &dy[n * out_len..(n + 1) * out_len],
                )
                .map_err(shape_err)?;
                let mut dcol_view =
                    ArrayViewMut2::from_shape((rows, cols), &mut dcol[..]).map_err(shape_err)?;
                dcol_view.fill(T::zero());
                general_mat_mul(T::one(), &w.t(), &dy_view, T::zero(), &mut dcol_view);
            }
            col2im(&dcol, g, &mut dx[n * in_len..(n + 1) * in_len]);
        }
        Ok(())
    }

    /// Gradient w.r.t. the filter, accumulated over the batch:
    /// `dW += dY[n] * col(X[n])^T`.
    pub fn conv2d_grad_filter_into(
        &mut self,
        input: &CPUStorage<T>,
        grad_output: &CPUStorage<T>,
        g: &ConvGeometry,
    ) -> Result<()> {
        let (rows, cols) = (g.col_rows(), g.col_cols());
        let (in_len, out_len) = (g.input_image_len(), g.output_image_len());
        let x = input.as_slice()?;
        let dy = grad_output.as_slice()?;
        let mut dw =
            ArrayViewMut2::from_shape((g.out_channels, rows), self.as_slice_mut()?)
                .map_err(shape_err)?;
        dw.fill(T::zero());

        let mut col = vec![T::zero(); rows * cols];
        for n in 0..g.batch {
            im2col(&x[n * in_len..(n + 1) * in_len], g, &mut col);
            let col_view = ArrayView2::from_shape((rows, cols), &col[..]).map_err(shape_err)?;
            let dy_view = ArrayView2::from_shape(
                (g.out_channels, cols),
                &dy[n * out_len..(n + 1) * out_len],
            )
            .map_err(shape_err)?;
            general_mat_mul(T::one(), &dy_view, &col_view.t(), T::one(), &mut dw);
        }
        Ok(())
    }
}
