#[cfg(test)]
mod tests {
    use crate::backend::{Tensor, cpu};
    use crate::math::PoolParams;
    use crate::ops::{Add, MatMul, Operator, Pooling, Sum};
    use ndarray::{Array2, array};

    fn tensor(a: &Array2<f64>) -> Tensor<f64> {
        Tensor::from_array(a.clone().into_dyn())
    }

    fn to_array2(t: &Tensor<f64>) -> Array2<f64> {
        let shape = t.shape();
        Array2::from_shape_vec((shape[0], shape[1]), t.to_vec().unwrap()).unwrap()
    }

    #[test]
    fn test_operator_names() {
        assert_eq!(Operator::<f32>::name(&Add::new()), "Add");
        assert_eq!(Operator::<f32>::name(&MatMul::new()), "MatMul");
        assert_eq!(Operator::<f64>::name(&Sum::new()), "Sum");
    }

    #[test]
    fn test_add_forward_and_backward() {
        let a = Tensor::from_vec(vec![1.0f32, 2.0], &[2], cpu()).unwrap();
        let b = Tensor::from_vec(vec![10.0f32, 20.0], &[2], cpu()).unwrap();
        let mut op = Add::new();
        let shape = Operator::<f32>::output_shape(&op, &[a.shape(), b.shape()]).unwrap();
        let mut out = Tensor::zeros(&shape, cpu()).unwrap();
        op.compute(&[&a, &b], &mut out).unwrap();
        assert_eq!(out.to_vec().unwrap(), vec![11.0, 22.0]);

        let upstream = Tensor::from_vec(vec![0.5f32, -1.0], &[2], cpu()).unwrap();
        let mut grad = Tensor::zeros(&[2], cpu()).unwrap();
        op.gradient(1, &[&a, &b], &out, &upstream, &mut grad).unwrap();
        assert_eq!(grad.to_vec().unwrap(), vec![0.5, -1.0]);
    }

    #[test]
    fn test_add_rejects_mismatched_shapes() {
        let op = Add::new();
        assert!(Operator::<f32>::output_shape(&op, &[&[2, 3], &[3, 2]]).is_err());
    }

    #[test]
    fn test_matmul_gradients_for_every_transpose_combination() {
        let a0 = array![[1.0, -2.0, 3.0], [0.5, 4.0, -1.0]];
        let b0 = array![[2.0, 0.0, 1.0, -1.0], [1.0, 3.0, -2.0, 0.5], [0.0, 1.0, 1.0, 2.0]];
        let g = array![[1.0, 2.0, -1.0, 0.5], [-3.0, 1.0, 0.0, 2.0]];
        let expected_c = a0.dot(&b0);
        let da0 = g.dot(&b0.t());
        let db0 = a0.t().dot(&g);

        for (ta, tb) in [(false, false), (true, false), (false, true), (true, true)] {
            let a_stored = if ta { a0.t().to_owned() } else { a0.clone() };
            let b_stored = if tb { b0.t().to_owned() } else { b0.clone() };
            let (a, b) = (tensor(&a_stored), tensor(&b_stored));
            let mut op = MatMul::with_transposes(ta, tb);

            let shape = Operator::<f64>::output_shape(&op, &[a.shape(), b.shape()]).unwrap();
            assert_eq!(shape, vec![2, 4]);
            let mut c = Tensor::zeros(&shape, cpu()).unwrap();
            op.compute(&[&a, &b], &mut c).unwrap();
            assert_eq!(to_array2(&c), expected_c, "forward ta={ta} tb={tb}");

            let upstream = tensor(&g);
            let mut ga = a.zeros_like().unwrap();
            let mut gb = b.zeros_like().unwrap();
            op.gradient(0, &[&a, &b], &c, &upstream, &mut ga).unwrap();
            op.gradient(1, &[&a, &b], &c, &upstream, &mut gb).unwrap();

            let want_a = if ta { da0.t().to_owned() } else { da0.clone() };
            let want_b = if tb { db0.t().to_owned() } else { db0.clone() };
            assert_eq!(to_array2(&ga), want_a, "dA ta={ta} tb={tb}");
            assert_eq!(to_array2(&gb), want_b, "dB ta={ta} tb={tb}");
        }
    }

    #[test]
    fn test_sum_forward_and_backward() {
        let x = Tensor::from_vec(vec![1i32, 2, 3, 4, 5, 6], &[2, 3], cpu()).unwrap();
        let mut op = Sum::new();
        let mut out = Tensor::zeros(&[1], cpu()).unwrap();
        op.compute(&[&x], &mut out).unwrap();
        assert_eq!(out.to_vec().unwrap(), vec![21]);

        let upstream = Tensor::from_vec(vec![3], &[1], cpu()).unwrap();
        let mut grad = Tensor::zeros(&[2, 3], cpu()).unwrap();
        op.gradient(0, &[&x], &out, &upstream, &mut grad).unwrap();
        assert_eq!(grad.to_vec().unwrap(), vec![3; 6]);
    }

    #[test]
    fn test_pooling_positions_follow_forward() {
        let x = Tensor::from_vec((0..16).map(|v| v as f32).collect(), &[1, 4, 4], cpu()).unwrap();
        let mut op = Pooling::new::<f32>(x.shape(), PoolParams::max(2, 2), cpu()).unwrap();
        assert_eq!(op.max_positions().shape(), &[1, 2, 2]);
        assert_eq!(op.max_positions().to_vec().unwrap(), vec![0; 4]);

        let shape = Operator::<f32>::output_shape(&op, &[x.shape()]).unwrap();
        let mut y = Tensor::zeros(&shape, cpu()).unwrap();
        op.compute(&[&x], &mut y).unwrap();
        assert_eq!(op.max_positions().to_vec().unwrap(), vec![5, 7, 13, 15]);

        let upstream = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], &shape, cpu()).unwrap();
        let mut grad = x.zeros_like().unwrap();
        op.gradient(0, &[&x], &y, &upstream, &mut grad).unwrap();
        let grad = grad.to_vec().unwrap();
        assert_eq!(grad.iter().sum::<f32>(), 10.0);
        assert_eq!(grad[15], 4.0);
    }
}
