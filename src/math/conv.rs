// src/math/conv.rs
use super::device_mismatch;
use crate::backend::{CudaNumeric, Device, NumericKind, Storage, Tensor};
use crate::error::{GraphError, Result};
use std::marker::PhantomData;

#[cfg(feature = "cuda")]
use crate::backend::cuda::ConvWorkspace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConvMode {
    #[default]
    CrossCorrelation,
    /// True convolution: the filter is flipped along both spatial axes.
    Convolution,
}

/// Padding, stride and dilation of a 2D convolution. Vertical (`_h`) and horizontal
/// (`_w`) components are kept apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Conv2dParams {
    pub pad_h: usize,
    pub pad_w: usize,
    pub stride_h: usize,
    pub stride_w: usize,
    pub dilation_h: usize,
    pub dilation_w: usize,
    pub mode: ConvMode,
}

impl Default for Conv2dParams {
    fn default() -> Self {
        Self {
            pad_h: 0,
            pad_w: 0,
            stride_h: 1,
            stride_w: 1,
            dilation_h: 1,
            dilation_w: 1,
            mode: ConvMode::CrossCorrelation,
        }
    }
}

impl Conv2dParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_padding(mut self, pad_h: usize, pad_w: usize) -> Self {
        self.pad_h = pad_h;
        self.pad_w = pad_w;
        self
    }

    pub fn with_stride(mut self, stride_h: usize, stride_w: usize) -> Self {
        self.stride_h = stride_h;
        self.stride_w = stride_w;
        self
    }

    pub fn with_dilation(mut self, dilation_h: usize, dilation_w: usize) -> Self {
        self.dilation_h = dilation_h;
        self.dilation_w = dilation_w;
        self
    }

    pub fn with_mode(mut self, mode: ConvMode) -> Self {
        self.mode = mode;
        self
    }
}

/// `floor((input + 2*pad - dilation*(kernel-1) - 1) / stride) + 1`.
pub(crate) fn output_extent(
    input: usize,
    kernel: usize,
    pad: usize,
    stride: usize,
    dilation: usize,
    axis: &str,
) -> Result<usize> {
    if stride == 0 || dilation == 0 {
        return Err(GraphError::invalid(format!(
            "{axis}: stride and dilation must be positive"
        )));
    }
    if input == 0 || kernel == 0 {
        return Err(GraphError::invalid(format!(
            "{axis}: input ({input}) and window ({kernel}) must be non-empty"
        )));
    }
    let span = dilation * (kernel - 1) + 1;
    let padded = input + 2 * pad;
    if padded < span {
        return Err(GraphError::invalid(format!(
            "{axis}: dilated window ({span}) larger than padded input ({padded})"
        )));
    }
    Ok((padded - span) / stride + 1)
}

/// Resolved dimensions of one convolution. Computed once from the input and filter
/// shapes; every kernel variant works from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvGeometry {
    pub batch: usize,
    pub in_channels: usize,
    pub in_h: usize,
    pub in_w: usize,
    pub out_channels: usize,
    pub kernel_h: usize,
    pub kernel_w: usize,
    pub out_h: usize,
    pub out_w: usize,
    pub params: Conv2dParams,
}

impl ConvGeometry {
    /// Input is `[C, H, W]` (one image) or `[N, C, H, W]`; filter is `[C, Kh, Kw]` (one
    /// output channel) or `[Co, C, Kh, Kw]`.
    pub fn new(input: &[usize], filter: &[usize], params: Conv2dParams) -> Result<Self> {
        let (batch, in_channels, in_h, in_w) = match *input {
            [c, h, w] => (1, c, h, w),
            [n, c, h, w] => (n, c, h, w),
            _ => {
                return Err(GraphError::UnsupportedRank {
                    what: "convolution input",
                    rank: input.len(),
                    expected: "3 or 4",
                });
            }
        };
        let (out_channels, filter_channels, kernel_h, kernel_w) = match *filter {
            [c, kh, kw] => (1, c, kh, kw),
            [k, c, kh, kw] => (k, c, kh, kw),
            _ => {
                return Err(GraphError::UnsupportedRank {
                    what: "convolution filter",
                    rank: filter.len(),
                    expected: "3 or 4",
                });
            }
        };
        if filter_channels != in_channels {
            return Err(GraphError::ChannelMismatch {
                input: in_channels,
                filter: filter_channels,
            });
        }
        if batch == 0 || in_channels == 0 || out_channels == 0 {
            return Err(GraphError::invalid(format!(
                "empty convolution operands {input:?} * {filter:?}"
            )));
        }
        let out_h = output_extent(
            in_h,
            kernel_h,
            params.pad_h,
            params.stride_h,
            params.dilation_h,
            "convolution height",
        )?;
        let out_w = output_extent(
            in_w,
            kernel_w,
            params.pad_w,
            params.stride_w,
            params.dilation_w,
            "convolution width",
        )?;

        Ok(Self {
            batch,
            in_channels,
            in_h,
            in_w,
            out_channels,
            kernel_h,
            kernel_w,
            out_h,
            out_w,
            params,
        })
    }

    /// `[N, Co, Ho, Wo]`, also for batchless inputs.
    pub fn output_shape(&self) -> Vec<usize> {
        vec![self.batch, self.out_channels, self.out_h, self.out_w]
    }

    /// Rows of the unfolded column matrix: `C * Kh * Kw`.
    pub fn col_rows(&self) -> usize {
        self.in_channels * self.kernel_h * self.kernel_w
    }

    /// Columns of the unfolded column matrix: `Ho * Wo`.
    pub fn col_cols(&self) -> usize {
        self.out_h * self.out_w
    }

    pub fn input_image_len(&self) -> usize {
        self.in_channels * self.in_h * self.in_w
    }

    pub fn output_image_len(&self) -> usize {
        self.out_channels * self.out_h * self.out_w
    }

    pub fn filter_len(&self) -> usize {
        self.out_channels * self.col_rows()
    }

    pub fn flip(&self) -> bool {
        self.params.mode == ConvMode::Convolution
    }

    /// Filter tap read at window position `(ky, kx)`.
    pub fn tap(&self, ky: usize, kx: usize) -> (usize, usize) {
        if self.flip() {
            (self.kernel_h - 1 - ky, self.kernel_w - 1 - kx)
        } else {
            (ky, kx)
        }
    }

    fn check_output(&self, shape: &[usize]) -> Result<()> {
        GraphError::check_shape(&self.output_shape(), shape)
    }
}

/// Convolution strategy on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvAlgorithm {
    /// Unfold each image into a column matrix and run one GEMM. Needs a workspace.
    Im2colGemm,
    /// One thread per output element, no workspace.
    Direct,
}

impl ConvAlgorithm {
    /// GEMM when the element type has a cuBLAS routine and the workspace fits.
    pub fn select(kind: NumericKind, workspace_bytes: usize, max_workspace_bytes: usize) -> Self {
        if kind.is_float() && workspace_bytes <= max_workspace_bytes {
            ConvAlgorithm::Im2colGemm
        } else {
            ConvAlgorithm::Direct
        }
    }
}

/// Execution settings of one convolution node: the chosen algorithm and, on the
/// device, the node's private workspaces. Host settings carry nothing.
#[derive(Debug)]
pub struct ConvSettings<T: CudaNumeric> {
    algorithm: ConvAlgorithm,
    #[cfg(feature = "cuda")]
    workspace: Option<ConvWorkspace<T>>,
    _marker: PhantomData<T>,
}

impl<T: CudaNumeric> ConvSettings<T> {
    pub fn host() -> Self {
        Self {
            algorithm: ConvAlgorithm::Im2colGemm,
            #[cfg(feature = "cuda")]
            workspace: None,
            _marker: PhantomData,
        }
    }

    /// Settings for a node on `device`. Device workspaces are allocated here, so a
    /// failure surfaces before the node exists.
    pub fn for_device(
        device: Device,
        geometry: &ConvGeometry,
        max_workspace_bytes: usize,
    ) -> Result<Self> {
        match device {
            Device::CPU => Ok(Self::host()),
            Device::CUDA(_) => Self::cuda(device, geometry, max_workspace_bytes),
        }
    }

    #[cfg(feature = "cuda")]
    fn cuda(device: Device, geometry: &ConvGeometry, max_workspace_bytes: usize) -> Result<Self> {
        crate::backend::manager::validate_device::<T>(device)?;
        let elements = geometry.col_rows() * geometry.col_cols();
        let bytes = 3 * elements * std::mem::size_of::<T>();
        let algorithm = ConvAlgorithm::select(T::KIND, bytes, max_workspace_bytes);
        let workspace = match algorithm {
            ConvAlgorithm::Im2colGemm => Some(crate::backend::with_cuda_context(|ctx| {
                ConvWorkspace::allocate(ctx, elements)
            })?),
            ConvAlgorithm::Direct => None,
        };
        tracing::debug!(?algorithm, bytes, max_workspace_bytes, "convolution algorithm selected");
        Ok(Self {
            algorithm,
            workspace,
            _marker: PhantomData,
        })
    }

    #[cfg(not(feature = "cuda"))]
    fn cuda(device: Device, _geometry: &ConvGeometry, _max_workspace_bytes: usize) -> Result<Self> {
        crate::backend::manager::validate_device::<T>(device)?;
        Err(GraphError::Unsupported(format!("convolution on {device}")))
    }

    pub fn algorithm(&self) -> ConvAlgorithm {
        self.algorithm
    }

    /// Bytes of device scratch memory owned by these settings.
    pub fn workspace_bytes(&self) -> usize {
        #[cfg(feature = "cuda")]
        {
            self.workspace.as_ref().map_or(0, |ws| ws.bytes())
        }
        #[cfg(not(feature = "cuda"))]
        {
            0
        }
    }

    #[cfg(feature = "cuda")]
    fn workspace_mut(&mut self) -> Option<&mut ConvWorkspace<T>> {
        self.workspace.as_mut()
    }
}

/// Forward convolution `out = x (*) filter`, `out` shaped `[N, Co, Ho, Wo]`.
#[cfg_attr(not(feature = "cuda"), allow(unused_variables))]
pub fn conv2d<T: CudaNumeric>(
    x: &Tensor<T>,
    filter: &Tensor<T>,
    out: &mut Tensor<T>,
    params: &Conv2dParams,
    settings: &mut ConvSettings<T>,
) -> Result<()> {
    let g = ConvGeometry::new(x.shape(), filter.shape(), *params)?;
    g.check_output(out.shape())?;
    let device = out.device();
    GraphError::check_device(device, x.device())?;
    GraphError::check_device(device, filter.device())?;

    match (x.storage(), filter.storage(), out.storage_mut()) {
        (Storage::Host(x), Storage::Host(w), Storage::Host(y)) => y.conv2d_into(x, w, &g),
        #[cfg(feature = "cuda")]
        (Storage::Cuda(x), Storage::Cuda(w), Storage::Cuda(y)) => {
            crate::backend::with_cuda_ops(|ops| ops.conv2d(x, w, y, &g, settings.workspace_mut()))
        }
        #[allow(unreachable_patterns)]
        (x, _, _) => Err(device_mismatch(device, x)),
    }
}

/// Gradient w.r.t. the convolution input. `dx` has the input's shape, `dy` the
/// output's.
#[cfg_attr(not(feature = "cuda"), allow(unused_variables))]
pub fn conv2d_grad_data<T: CudaNumeric>(
    filter: &Tensor<T>,
    dy: &Tensor<T>,
    dx: &mut Tensor<T>,
    params: &Conv2dParams,
    settings: &mut ConvSettings<T>,
) -> Result<()> {
    let g = ConvGeometry::new(dx.shape(), filter.shape(), *params)?;
    g.check_output(dy.shape())?;
    let device = dx.device();
    GraphError::check_device(device, filter.device())?;
    GraphError::check_device(device, dy.device())?;

    match (filter.storage(), dy.storage(), dx.storage_mut()) {
        (Storage::Host(w), Storage::Host(dy), Storage::Host(dx)) => {
            dx.conv2d_grad_data_into(w, dy, &g)
        }
        #[cfg(feature = "cuda")]
        (Storage::Cuda(w), Storage::Cuda(dy), Storage::Cuda(dx)) => {
            crate::backend::with_cuda_ops(|ops| {
                ops.conv2d_grad_data(w, dy, dx, &g, settings.workspace_mut())
            })
        }
        #[allow(unreachable_patterns)]
        (w, _, _) => Err(device_mismatch(device, w)),
    }
}

/// Gradient w.r.t. the filter, summed over the batch. `dw` has the filter's shape.
#[cfg_attr(not(feature = "cuda"), allow(unused_variables))]
pub fn conv2d_grad_filter<T: CudaNumeric>(
    x: &Tensor<T>,
    dy: &Tensor<T>,
    dw: &mut Tensor<T>,
    params: &Conv2dParams,
    settings: &mut ConvSettings<T>,
) -> Result<()> {
    let g = ConvGeometry::new(x.shape(), dw.shape(), *params)?;
    g.check_output(dy.shape())?;
    let device = dw.device();
    GraphError::check_device(device, x.device())?;
    GraphError::check_device(device, dy.device())?;

    match (x.storage(), dy.storage(), dw.storage_mut()) {
        (Storage::Host(x), Storage::Host(dy), Storage::Host(dw)) => {
            dw.conv2d_grad_filter_into(x, dy, &g)
        }
        #[cfg(feature = "cuda")]
        (Storage::Cuda(x), Storage::Cuda(dy), Storage::Cuda(dw)) => {
            crate::backend::with_cuda_ops(|ops| {
                ops.conv2d_grad_filter(x, dy, dw, &g, settings.workspace_mut())
            })
        }
        #[allow(unreachable_patterns)]
        (x, _, _) => Err(device_mismatch(device, x)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::cpu;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_geometry_same_padding() {
        let g = ConvGeometry::new(&[1, 3, 8, 8], &[4, 3, 3, 3], Conv2dParams::new().with_padding(1, 1))
            .unwrap();
        assert_eq!(g.output_shape(), vec![1, 4, 8, 8]);
        assert_eq!(g.col_rows(), 27);
        assert_eq!(g.col_cols(), 64);
    }

    #[test]
    fn test_geometry_stride_and_dilation() {
        // Hi=9, pad 0, dilation 2, 3x3 => span 5, (9 - 5) / 2 + 1 = 3
        let params = Conv2dParams::new().with_stride(2, 1).with_dilation(2, 1);
        let g = ConvGeometry::new(&[2, 1, 9, 6], &[1, 3, 3], params).unwrap();
        assert_eq!(g.output_shape(), vec![2, 1, 3, 4]);
    }

    #[test]
    fn test_geometry_errors() {
        let p = Conv2dParams::new();
        assert!(matches!(
            ConvGeometry::new(&[8, 8], &[1, 1, 3, 3], p),
            Err(GraphError::UnsupportedRank { what: "convolution input", rank: 2, .. })
        ));
        assert!(matches!(
            ConvGeometry::new(&[1, 1, 8, 8], &[3, 3], p),
            Err(GraphError::UnsupportedRank { what: "convolution filter", .. })
        ));
        assert_eq!(
            ConvGeometry::new(&[1, 3, 8, 8], &[4, 2, 3, 3], p).unwrap_err(),
            GraphError::ChannelMismatch { input: 3, filter: 2 }
        );
        assert!(matches!(
            ConvGeometry::new(&[1, 1, 2, 2], &[1, 1, 3, 3], p),
            Err(GraphError::InvalidParameter(_))
        ));
        assert!(matches!(
            ConvGeometry::new(&[1, 1, 4, 4], &[1, 1, 3, 3], p.with_stride(0, 1)),
            Err(GraphError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_tap_flips_for_convolution() {
        let p = Conv2dParams::new().with_mode(ConvMode::Convolution);
        let g = ConvGeometry::new(&[1, 4, 4], &[1, 2, 3], p).unwrap();
        assert_eq!(g.tap(0, 0), (1, 2));
        assert_eq!(g.tap(1, 2), (0, 0));
    }

    #[test]
    fn test_algorithm_selection() {
        assert_eq!(
            ConvAlgorithm::select(NumericKind::Float32, 1024, 4096),
            ConvAlgorithm::Im2colGemm
        );
        assert_eq!(
            ConvAlgorithm::select(NumericKind::Float32, 8192, 4096),
            ConvAlgorithm::Direct
        );
        assert_eq!(
            ConvAlgorithm::select(NumericKind::Int32, 0, 4096),
            ConvAlgorithm::Direct
        );
    }

    #[test]
    fn test_conv2d_known_values() {
        // 1x1x3x3 input, 2x2 all-ones filter => sums of 2x2 windows
        let x = Tensor::from_vec((1..=9).map(|v| v as f64).collect(), &[1, 1, 3, 3], cpu())
            .unwrap();
        let w = Tensor::from_vec(vec![1.0; 4], &[1, 1, 2, 2], cpu()).unwrap();
        let mut y = Tensor::zeros(&[1, 1, 2, 2], cpu()).unwrap();
        let mut settings = ConvSettings::host();
        conv2d(&x, &w, &mut y, &Conv2dParams::new(), &mut settings).unwrap();
        assert_eq!(y.to_vec().unwrap(), vec![12.0, 16.0, 24.0, 28.0]);
        assert_eq!(settings.workspace_bytes(), 0);
    }

    #[test]
    fn test_convolution_mode_flips_filter() {
        let x = Tensor::from_vec((1..=9).map(|v| v as f64).collect(), &[1, 3, 3], cpu())
            .unwrap();
        // filter [[1, 0], [0, 0]]: cross-correlation picks top-left, convolution bottom-right
        let w = Tensor::from_vec(vec![1.0, 0.0, 0.0, 0.0], &[1, 2, 2], cpu()).unwrap();
        let mut settings = ConvSettings::host();

        let mut y = Tensor::zeros(&[1, 1, 2, 2], cpu()).unwrap();
        conv2d(&x, &w, &mut y, &Conv2dParams::new(), &mut settings).unwrap();
        assert_eq!(y.to_vec().unwrap(), vec![1.0, 2.0, 4.0, 5.0]);

        let p = Conv2dParams::new().with_mode(ConvMode::Convolution);
        conv2d(&x, &w, &mut y, &p, &mut settings).unwrap();
        assert_eq!(y.to_vec().unwrap(), vec![5.0, 6.0, 8.0, 9.0]);
    }

    #[test]
    fn test_conv2d_padding_and_stride() {
        let x = Tensor::from_vec(vec![1.0f32; 16], &[1, 1, 4, 4], cpu()).unwrap();
        let w = Tensor::from_vec(vec![1.0f32; 9], &[1, 1, 3, 3], cpu()).unwrap();
        let p = Conv2dParams::new().with_padding(1, 1).with_stride(2, 2);
        let mut y = Tensor::zeros(&[1, 1, 2, 2], cpu()).unwrap();
        conv2d(&x, &w, &mut y, &p, &mut ConvSettings::host()).unwrap();
        // windows centred on (0,0), (0,2), (2,0), (2,2)
        assert_eq!(y.to_vec().unwrap(), vec![4.0, 6.0, 6.0, 9.0]);
    }

    #[test]
    fn test_conv2d_rejects_wrong_output_shape() {
        let x = Tensor::<f32>::zeros(&[1, 1, 4, 4], cpu()).unwrap();
        let w = Tensor::<f32>::zeros(&[1, 1, 3, 3], cpu()).unwrap();
        let mut y = Tensor::zeros(&[1, 1, 4, 4], cpu()).unwrap();
        let err = conv2d(&x, &w, &mut y, &Conv2dParams::new(), &mut ConvSettings::host());
        assert!(matches!(err, Err(GraphError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_grad_filter_of_single_tap() {
        // y = sum over windows of w * x, dy = ones => dW[ky,kx] = sum of x over the
        // positions that tap visits
        let x = Tensor::from_vec((1..=9).map(|v| v as f64).collect(), &[1, 1, 3, 3], cpu())
            .unwrap();
        let dy = Tensor::from_vec(vec![1.0; 4], &[1, 1, 2, 2], cpu()).unwrap();
        let mut dw = Tensor::zeros(&[1, 1, 2, 2], cpu()).unwrap();
        conv2d_grad_filter(&x, &dy, &mut dw, &Conv2dParams::new(), &mut ConvSettings::host())
            .unwrap();
        let dw = dw.to_vec().unwrap();
        assert_abs_diff_eq!(dw[0], 1.0 + 2.0 + 4.0 + 5.0);
        assert_abs_diff_eq!(dw[3], 5.0 + 6.0 + 8.0 + 9.0);
    }

    #[test]
    fn test_grad_data_counts_window_coverage() {
        // all-ones 2x2 filter, dy = ones => dx counts how many windows cover each pixel
        let w = Tensor::from_vec(vec![1.0f64; 4], &[1, 1, 2, 2], cpu()).unwrap();
        let dy = Tensor::from_vec(vec![1.0; 4], &[1, 1, 2, 2], cpu()).unwrap();
        let mut dx = Tensor::zeros(&[1, 1, 3, 3], cpu()).unwrap();
        conv2d_grad_data(&w, &dy, &mut dx, &Conv2dParams::new(), &mut ConvSettings::host())
            .unwrap();
        assert_eq!(
            dx.to_vec().unwrap(),
            vec![1.0, 2.0, 1.0, 2.0, 4.0, 2.0, 1.0, 2.0, 1.0]
        );
    }
}
