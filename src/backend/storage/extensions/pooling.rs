// src/backend/storage/extensions/pooling.rs
use crate::backend::CudaNumeric;
use crate::backend::storage::CPUStorage;
use crate::error::{GraphError, Result};
use crate::math::{PoolGeometry, PoolingMode};

/// Calls `f` with the plane offset of every in-bounds tap of the window that produces
/// output cell `(oy, ox)`.
fn for_each_tap(g: &PoolGeometry, oy: usize, ox: usize, mut f: impl FnMut(usize)) {
    let p = &g.params;
    for ky in 0..p.filter_h {
        let iy = (oy * p.stride_h + ky * p.dilation_h) as isize - p.pad_h as isize;
        if iy < 0 || iy as usize >= g.in_h {
            continue;
        }
        for kx in 0..p.filter_w {
            let ix = (ox * p.stride_w + kx * p.dilation_w) as isize - p.pad_w as isize;
            if ix < 0 || ix as usize >= g.in_w {
                continue;
            }
            f(iy as usize * g.in_w + ix as usize);
        }
    }
}

impl<T: CudaNumeric> CPUStorage<T> {
    /// Pools `input` into `self`. For max pooling `positions` receives the flat index
    /// into `input` of each winner, or -1 when the window only saw padding. Average
    /// pooling divides by the full window size and writes -1 everywhere.
    pub fn pool2d_into(
        &mut self,
        input: &CPUStorage<T>,
        positions: &mut CPUStorage<i32>,
        g: &PoolGeometry,
    ) -> Result<()> {
        if input.as_slice()?.len() > i32::MAX as usize {
            return Err(GraphError::invalid(
                "pooling input too large for 32-bit max positions",
            ));
        }
        let x = input.as_slice()?;
        let y = self.as_slice_mut()?;
        let pos = positions.as_slice_mut()?;
        let (in_plane, out_plane) = (g.in_h * g.in_w, g.out_h * g.out_w);
        let window = T::from_count(g.params.filter_h * g.params.filter_w);

        for plane in 0..g.planes() {
            let src = plane * in_plane;
            for oy in 0..g.out_h {
                for ox in 0..g.out_w {
                    let o = plane * out_plane + oy * g.out_w + ox;
                    match g.params.mode {
                        PoolingMode::Max => {
                            let mut best = T::lowest();
                            let mut winner: Option<usize> = None;
                            for_each_tap(g, oy, ox, |off| {
                                let v = x[src + off];
                                if winner.is_none() || v > best {
                                    best = v;
                                    winner = Some(src + off);
                                }
                            });
                            y[o] = if winner.is_some() { best } else { T::zero() };
                            pos[o] = winner.map_or(-1, |i| i as i32);
                        }
                        PoolingMode::Average => {
                            let mut sum = T::zero();
                            for_each_tap(g, oy, ox, |off| sum = sum.wrapping_add(x[src + off]));
                            y[o] = sum / window;
                            pos[o] = -1;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Pooling backward into `self` (shaped like the pooled input). Max pooling routes
    /// each upstream value to its recorded winner only; average pooling spreads
    /// `dy / (filter_h * filter_w)` over the in-bounds taps.
    pub fn pool2d_grad_into(
        &mut self,
        grad_output: &CPUStorage<T>,
        positions: &CPUStorage<i32>,
        g: &PoolGeometry,
    ) -> Result<()> {
        let dy = grad_output.as_slice()?;
        let pos = positions.as_slice()?;
        let dx = self.as_slice_mut()?;
        dx.fill(T::zero());
        let (in_plane, out_plane) = (g.in_h * g.in_w, g.out_h * g.out_w);

        match g.params.mode {
            PoolingMode::Max => {
                for (o, &p) in pos.iter().enumerate() {
                    if p < 0 {
                        continue;
                    }
                    let slot = dx.get_mut(p as usize).ok_or_else(|| {
                        GraphError::invalid(format!("max position {p} out of range"))
                    })?;
                    *slot += dy[o];
                }
            }
            PoolingMode::Average => {
                let window = T::from_count(g.params.filter_h * g.params.filter_w);
                for plane in 0..g.planes() {
                    let dst = plane * in_plane;
                    for oy in 0..g.out_h {
                        for ox in 0..g.out_w {
                            let share = dy[plane * out_plane + oy * g.out_w + ox] / window;
                            for_each_tap(g, oy, ox, |off| dx[dst + off] += share);
                        }
                    }
                }
            }
        }
        Ok(())
    }
}
