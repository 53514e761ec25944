#[cfg(test)]
mod tests {
    use crate::backend::{Fill, Tensor, cpu};
    use crate::config::EngineConfig;
    use crate::error::GraphError;
    use crate::graph::{Engine, NodeId};
    use crate::math::{Conv2dParams, ConvMode, PoolParams};
    use approx::assert_abs_diff_eq;
    use ndarray::{Array2, array};

    fn seeded() -> Engine<f64> {
        Engine::with_config(EngineConfig::default().with_seed(42))
    }

    fn from_array2(engine: &mut Engine<f64>, a: &Array2<f64>, requires_grad: bool) -> NodeId {
        engine.variable(Tensor::from_array(a.clone().into_dyn()), requires_grad)
    }

    fn to_array2(t: &Tensor<f64>) -> Array2<f64> {
        let shape = t.shape();
        Array2::from_shape_vec((shape[0], shape[1]), t.to_vec().unwrap()).unwrap()
    }

    fn assert_close(actual: &[f64], expected: &[f64], eps: f64) {
        assert_eq!(actual.len(), expected.len());
        for (a, e) in actual.iter().zip(expected) {
            assert_abs_diff_eq!(*a, *e, epsilon = eps);
        }
    }

    #[test]
    fn test_matmul_matches_reference_product() {
        let a0 = array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]];
        let b0 = array![[7.0, 8.0], [9.0, 10.0], [11.0, 12.0]];
        let expected = a0.dot(&b0);

        let mut engine = seeded();
        let a = from_array2(&mut engine, &a0, false);
        let b = from_array2(&mut engine, &b0, false);
        let c = engine.matmul(a, b).unwrap();
        assert_eq!(engine.output_shape(c).unwrap(), &[2, 2]);
        assert_eq!(to_array2(engine.eval(c, false).unwrap()), expected);

        // Same product from transposed storage, without copying anything back
        let at = from_array2(&mut engine, &a0.t().to_owned(), false);
        let bt = from_array2(&mut engine, &b0.t().to_owned(), false);
        let c_t = engine.matmul_with(at, true, bt, true).unwrap();
        assert_eq!(to_array2(engine.eval(c_t, false).unwrap()), expected);
    }

    #[test]
    fn test_matmul_dimension_mismatch_inserts_no_node() {
        let mut engine = seeded();
        let a = engine.tensor(&[2, 3], Fill::Zeros, false).unwrap();
        let b = engine.tensor(&[2, 3], Fill::Zeros, false).unwrap();
        let before = engine.len();
        let err = engine.matmul(a, b).unwrap_err();
        assert!(matches!(err, GraphError::DimensionMismatch { .. }));
        assert_eq!(engine.len(), before);
        assert!(matches!(
            engine.add(a, NodeId(99)),
            Err(GraphError::NodeNotFound(_))
        ));
    }

    #[test]
    fn test_conv_output_shape() {
        let mut engine = seeded();
        let x = engine
            .tensor(&[1, 3, 8, 8], Fill::Uniform { low: -1.0, high: 1.0 }, false)
            .unwrap();
        let w = engine
            .tensor(&[4, 3, 3, 3], Fill::Normal { mean: 0.0, std: 0.1 }, true)
            .unwrap();
        let y = engine
            .conv2d(x, w, Conv2dParams::new().with_padding(1, 1), true)
            .unwrap();
        assert_eq!(engine.output_shape(y).unwrap(), &[1, 4, 8, 8]);
        assert_eq!(engine.eval(y, false).unwrap().shape(), &[1, 4, 8, 8]);
        assert_eq!(engine.node(y).unwrap().op_name(), "Conv2d");
    }

    #[test]
    fn test_conv_channel_mismatch() {
        let mut engine = seeded();
        let x = engine.tensor(&[1, 3, 8, 8], Fill::Zeros, false).unwrap();
        let w = engine.tensor(&[4, 2, 3, 3], Fill::Zeros, true).unwrap();
        let err = engine.conv2d(x, w, Conv2dParams::default(), true).unwrap_err();
        assert_eq!(err, GraphError::ChannelMismatch { input: 3, filter: 2 });
        assert_eq!(engine.len(), 2);
    }

    #[test]
    fn test_eval_is_memoized_unless_recomputed() {
        let mut engine = seeded();
        let x = engine.tensor(&[2, 2], Fill::ones(), false).unwrap();
        let w = engine.tensor(&[2, 2], Fill::Constant(2.0), false).unwrap();
        let y = engine.matmul(x, w).unwrap();
        let z = engine.add(y, y).unwrap();

        engine.eval(z, false).unwrap();
        engine.eval(z, false).unwrap();
        assert_eq!(engine.evaluation_count(y).unwrap(), 1);
        assert_eq!(engine.evaluation_count(z).unwrap(), 1);

        // y feeds z twice but runs once per recompute
        let value = engine.eval(z, true).unwrap().to_vec().unwrap();
        assert_eq!(value, vec![8.0; 4]);
        assert_eq!(engine.evaluation_count(y).unwrap(), 2);
        assert_eq!(engine.evaluation_count(z).unwrap(), 2);

        // leaves are returned as-is
        engine.eval(x, true).unwrap();
        assert_eq!(engine.evaluation_count(x).unwrap(), 0);
    }

    #[test]
    fn test_diamond_gradients_are_summed() {
        let x0 = array![[1.0, -1.0, 2.0], [0.5, 3.0, -2.0]];
        let w0 = array![[1.0, 0.0, 2.0, -1.0], [0.5, 1.0, -1.0, 2.0], [-2.0, 1.5, 0.0, 1.0]];
        let v0 = array![[1.0], [-2.0], [0.5], [3.0]];

        let mut engine = seeded();
        let x = from_array2(&mut engine, &x0, true);
        let w = from_array2(&mut engine, &w0, true);
        let v = from_array2(&mut engine, &v0, true);
        let g = engine.matmul(x, w).unwrap();
        let s1 = engine.sum(g).unwrap();
        let h = engine.matmul(g, v).unwrap();
        let s2 = engine.sum(h).unwrap();
        let loss = engine.add(s1, s2).unwrap();

        let grads = engine.backward(loss).unwrap();

        // dloss/dg[i][j] = 1 + v[j]
        let dg = Array2::from_shape_fn((2, 4), |(_, j)| 1.0 + v0[[j, 0]]);
        let g0 = x0.dot(&w0);
        assert_eq!(to_array2(grads.get(g).unwrap()), dg);
        assert_eq!(to_array2(grads.get(x).unwrap()), dg.dot(&w0.t()));
        assert_eq!(to_array2(grads.get(w).unwrap()), x0.t().dot(&dg));
        assert_eq!(to_array2(grads.get(v).unwrap()), g0.t().dot(&Array2::ones((2, 1))));
        assert_eq!(grads.get(loss).unwrap().to_vec().unwrap(), vec![1.0]);
    }

    #[test]
    fn test_backward_twice_gives_same_result() {
        let mut engine = seeded();
        let x = engine
            .tensor(&[3, 2], Fill::Uniform { low: -1.0, high: 1.0 }, true)
            .unwrap();
        let w = engine
            .tensor(&[2, 4], Fill::Uniform { low: -1.0, high: 1.0 }, true)
            .unwrap();
        let y = engine.matmul(x, w).unwrap();
        let loss = engine.sum(y).unwrap();

        let first = engine.backward(loss).unwrap().get(w).unwrap().to_vec().unwrap();
        let second = engine.backward(loss).unwrap().get(w).unwrap().to_vec().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_duplicate_input_gradient() {
        let mut engine = seeded();
        let x = engine.tensor(&[3], Fill::Constant(1.5), true).unwrap();
        let y = engine.add(x, x).unwrap();
        let loss = engine.sum(y).unwrap();
        let grads = engine.backward(loss).unwrap();
        assert_eq!(grads.get(x).unwrap().to_vec().unwrap(), vec![2.0; 3]);

        let upstream = Tensor::from_vec(vec![1.0, -1.0, 0.5], &[3], cpu()).unwrap();
        let grad = engine.grad(y, Some(loss), x, &upstream).unwrap();
        assert_eq!(grad.to_vec().unwrap(), vec![2.0, -2.0, 1.0]);
    }

    #[test]
    fn test_inputs_without_requires_grad_are_skipped() {
        let mut engine = seeded();
        let x = engine.tensor(&[2, 3], Fill::ones(), false).unwrap();
        let w = engine.tensor(&[3, 1], Fill::ones(), true).unwrap();
        let y = engine.matmul(x, w).unwrap();
        let loss = engine.sum(y).unwrap();
        assert!(engine.node(y).unwrap().requires_grad());

        let grads = engine.backward(loss).unwrap();
        assert!(!grads.contains(x));
        assert_eq!(grads.get(w).unwrap().to_vec().unwrap(), vec![2.0; 3]);
        assert!(engine.node(y).unwrap().cached_gradient(x).is_none());
    }

    #[test]
    fn test_max_pool_routes_gradient_to_winners() {
        let mut engine = seeded();
        let data: Vec<f64> = (0..16).map(|v| v as f64).collect();
        let x = engine.variable(Tensor::from_vec(data, &[1, 1, 4, 4], cpu()).unwrap(), true);
        let p = engine.pooling(x, PoolParams::max(2, 2), true).unwrap();
        let loss = engine.sum(p).unwrap();

        assert_eq!(engine.eval(p, false).unwrap().to_vec().unwrap(), vec![5.0, 7.0, 13.0, 15.0]);
        let grads = engine.backward(loss).unwrap();
        let dx = grads.get(x).unwrap().to_vec().unwrap();
        for (i, g) in dx.iter().enumerate() {
            let expected = if [5, 7, 13, 15].contains(&i) { 1.0 } else { 0.0 };
            assert_eq!(*g, expected, "element {i}");
        }
    }

    #[test]
    fn test_average_pool_spreads_gradient() {
        let mut engine = seeded();
        let x = engine
            .tensor(&[2, 4, 4], Fill::Uniform { low: 0.0, high: 1.0 }, true)
            .unwrap();
        let p = engine.pooling(x, PoolParams::average(2, 2), true).unwrap();
        assert_eq!(engine.output_shape(p).unwrap(), &[2, 2, 2]);
        let loss = engine.sum(p).unwrap();

        let grads = engine.backward(loss).unwrap();
        assert_close(&grads.get(x).unwrap().to_vec().unwrap(), &[0.25; 32], 1e-12);
    }

    #[test]
    fn test_invalid_variable() {
        let mut engine = seeded();
        let a = engine.tensor(&[2], Fill::ones(), true).unwrap();
        let b = engine.tensor(&[2], Fill::ones(), true).unwrap();
        let unrelated = engine.tensor(&[2], Fill::ones(), true).unwrap();
        let y = engine.add(a, b).unwrap();
        let upstream = Tensor::ones(&[2], cpu()).unwrap();

        let err = engine.grad(y, None, unrelated, &upstream).unwrap_err();
        assert_eq!(err, GraphError::InvalidVariable { node: y, variable: unrelated });
        assert!(engine.node(y).unwrap().cached_gradient(unrelated).is_none());

        // the consumer must read from the node
        let err = engine.grad(y, Some(a), a, &upstream).unwrap_err();
        assert_eq!(err, GraphError::InvalidVariable { node: a, variable: y });

        let grad = engine.grad(y, None, b, &upstream).unwrap();
        assert_eq!(grad.to_vec().unwrap(), vec![1.0, 1.0]);
    }

    #[test]
    fn test_grad_rejects_wrong_upstream_shape() {
        let mut engine = seeded();
        let a = engine.tensor(&[2, 2], Fill::ones(), true).unwrap();
        let y = engine.sum(a).unwrap();
        let upstream = Tensor::ones(&[2], cpu()).unwrap();
        assert!(matches!(
            engine.grad(y, None, a, &upstream),
            Err(GraphError::ShapeMismatch { .. })
        ));
    }

    // Sum of a convolution is linear in both operands, so central differences are exact
    // up to rounding.
    fn check_conv_gradients(params: Conv2dParams, x_shape: &[usize], w_shape: &[usize]) {
        let mut engine = seeded();
        let x = engine
            .tensor(x_shape, Fill::Uniform { low: -1.0, high: 1.0 }, true)
            .unwrap();
        let w = engine
            .tensor(w_shape, Fill::Uniform { low: -1.0, high: 1.0 }, true)
            .unwrap();
        let y = engine.conv2d(x, w, params, true).unwrap();
        let y_shape = engine.output_shape(y).unwrap().to_vec();
        let y_len: usize = y_shape.iter().product();
        let loss = engine.sum(y).unwrap();
        let grads = engine.backward(loss).unwrap();
        let dx = grads.get(x).unwrap().to_vec().unwrap();
        let dw = grads.get(w).unwrap().to_vec().unwrap();

        let eps = 1e-3;
        for (node, analytic) in [(x, dx), (w, dw)] {
            let base = engine.value(node).unwrap().to_vec().unwrap();
            let shape = engine.output_shape(node).unwrap().to_vec();
            for i in (0..base.len()).step_by(5) {
                let mut plus = base.clone();
                plus[i] += eps;
                engine.set_value(node, Tensor::from_vec(plus, &shape, cpu()).unwrap()).unwrap();
                let up = engine.eval(loss, true).unwrap().to_vec().unwrap()[0];

                let mut minus = base.clone();
                minus[i] -= eps;
                engine.set_value(node, Tensor::from_vec(minus, &shape, cpu()).unwrap()).unwrap();
                let down = engine.eval(loss, true).unwrap().to_vec().unwrap()[0];

                let numeric = (up - down) / (2.0 * eps);
                assert_abs_diff_eq!(analytic[i], numeric, epsilon = 1e-6);
            }
            engine.set_value(node, Tensor::from_vec(base, &shape, cpu()).unwrap()).unwrap();
        }

        // Non-uniform upstream through the per-node gradient request, for the data and
        // the filter gradient
        let weights = Tensor::from_vec(
            (0..y_len).map(|i| 0.5 + (i % 7) as f64 * 0.25).collect(),
            &y_shape,
            cpu(),
        )
        .unwrap();
        engine.eval(y, true).unwrap();
        let dx_weighted = engine.grad(y, None, x, &weights).unwrap().to_vec().unwrap();
        let dw_weighted = engine.grad(y, None, w, &weights).unwrap().to_vec().unwrap();
        let weighted_loss = |engine: &mut Engine<f64>| -> f64 {
            let out = engine.eval(y, true).unwrap().to_vec().unwrap();
            out.iter()
                .zip(weights.to_vec().unwrap())
                .map(|(o, m)| o * m)
                .sum()
        };
        for (node, analytic) in [(x, dx_weighted), (w, dw_weighted)] {
            let base = engine.value(node).unwrap().to_vec().unwrap();
            let shape = engine.output_shape(node).unwrap().to_vec();
            for i in (0..base.len()).step_by(3) {
                let mut plus = base.clone();
                plus[i] += eps;
                engine.set_value(node, Tensor::from_vec(plus, &shape, cpu()).unwrap()).unwrap();
                let up = weighted_loss(&mut engine);
                let mut minus = base.clone();
                minus[i] -= eps;
                engine.set_value(node, Tensor::from_vec(minus, &shape, cpu()).unwrap()).unwrap();
                let down = weighted_loss(&mut engine);
                assert_abs_diff_eq!(analytic[i], (up - down) / (2.0 * eps), epsilon = 1e-6);
            }
            engine.set_value(node, Tensor::from_vec(base, &shape, cpu()).unwrap()).unwrap();
        }
    }

    #[test]
    fn test_conv_gradients_match_finite_differences() {
        check_conv_gradients(
            Conv2dParams::new().with_padding(1, 1).with_stride(2, 1),
            &[2, 2, 5, 6],
            &[3, 2, 3, 3],
        );
    }

    #[test]
    fn test_true_convolution_with_dilation_gradients() {
        check_conv_gradients(
            Conv2dParams::new()
                .with_padding(2, 1)
                .with_dilation(2, 1)
                .with_mode(ConvMode::Convolution),
            &[1, 3, 6, 5],
            &[2, 3, 2, 3],
        );
    }

    #[test]
    fn test_batchless_conv_with_single_filter() {
        let mut engine = seeded();
        let x = engine.tensor(&[1, 3, 3], Fill::ones(), true).unwrap();
        let w = engine.tensor(&[1, 2, 2], Fill::ones(), true).unwrap();
        let y = engine.conv2d(x, w, Conv2dParams::default(), true).unwrap();
        assert_eq!(engine.output_shape(y).unwrap(), &[1, 1, 2, 2]);
        assert_eq!(engine.eval(y, false).unwrap().to_vec().unwrap(), vec![4.0; 4]);

        let loss = engine.sum(y).unwrap();
        let grads = engine.backward(loss).unwrap();
        // corners are covered by one window, edges by two, the center by four
        assert_eq!(
            grads.get(x).unwrap().to_vec().unwrap(),
            vec![1.0, 2.0, 1.0, 2.0, 4.0, 2.0, 1.0, 2.0, 1.0]
        );
        assert_eq!(grads.get(w).unwrap().to_vec().unwrap(), vec![4.0; 4]);
    }

    #[test]
    fn test_set_value_and_recompute() {
        let mut engine = seeded();
        let x = engine.variable(Tensor::from_vec(vec![1.0, 2.0, 3.0], &[3], cpu()).unwrap(), false);
        let y = engine.sum(x).unwrap();
        assert_eq!(engine.eval(y, false).unwrap().to_vec().unwrap(), vec![6.0]);

        engine
            .set_value(x, Tensor::from_vec(vec![10.0, 20.0, 30.0], &[3], cpu()).unwrap())
            .unwrap();
        assert_eq!(engine.eval(y, false).unwrap().to_vec().unwrap(), vec![6.0]);
        assert_eq!(engine.eval(y, true).unwrap().to_vec().unwrap(), vec![60.0]);

        let wrong = Tensor::zeros(&[4], cpu()).unwrap();
        assert!(matches!(engine.set_value(x, wrong), Err(GraphError::ShapeMismatch { .. })));
        let same_shape = Tensor::zeros(&[1], cpu()).unwrap();
        assert!(matches!(
            engine.set_value(y, same_shape),
            Err(GraphError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_value_before_eval_and_introspection() {
        let mut engine = seeded();
        let x = engine.tensor(&[2, 2], Fill::ones(), true).unwrap();
        let y = engine.sum(x).unwrap();
        assert_eq!(engine.value(y).unwrap_err(), GraphError::NotEvaluated(y));
        assert_eq!(engine.node(y).unwrap().inputs(), &[x]);
        assert_eq!(engine.node(y).unwrap().op_name(), "Sum");
        assert_eq!(engine.node(x).unwrap().op_name(), "Leaf");
        assert_eq!(y.to_string(), "node#1");
        assert_eq!(engine.len(), 2);

        engine.set_asynchronous(y, true).unwrap();
        assert!(engine.node(y).unwrap().is_asynchronous());
        // asynchronous is a no-op on the host
        assert_eq!(engine.eval(y, false).unwrap().to_vec().unwrap(), vec![4.0]);
    }

    #[test]
    fn test_integer_graph() {
        let mut engine: Engine<i32> = Engine::new();
        let a = engine.variable(Tensor::from_vec(vec![1, 2, 3, 4], &[2, 2], cpu()).unwrap(), true);
        let b = engine.variable(Tensor::from_vec(vec![1, 0, 0, 1], &[2, 2], cpu()).unwrap(), true);
        let c = engine.matmul(a, b).unwrap();
        let d = engine.add(c, a).unwrap();
        let loss = engine.sum(d).unwrap();
        assert_eq!(engine.eval(loss, false).unwrap().to_vec().unwrap(), vec![20]);

        let grads = engine.backward(loss).unwrap();
        // dloss/da = ones * b^T + ones
        assert_eq!(grads.get(a).unwrap().to_vec().unwrap(), vec![2, 2, 2, 2]);
    }

    #[test]
    fn test_integer_sum_and_add_wrap_on_overflow() {
        let mut engine: Engine<i32> = Engine::new();
        let x = engine.variable(Tensor::from_vec(vec![i32::MAX, 1], &[2], cpu()).unwrap(), true);
        let total = engine.sum(x).unwrap();
        assert_eq!(engine.eval(total, false).unwrap().to_vec().unwrap(), vec![i32::MIN]);

        let one = engine.variable(Tensor::from_vec(vec![1], &[1], cpu()).unwrap(), false);
        let shifted = engine.add(total, one).unwrap();
        assert_eq!(
            engine.eval(shifted, false).unwrap().to_vec().unwrap(),
            vec![i32::MIN + 1]
        );

        let top = engine.variable(Tensor::from_vec(vec![i32::MAX], &[1], cpu()).unwrap(), false);
        let wrapped = engine.add(top, one).unwrap();
        assert_eq!(engine.eval(wrapped, false).unwrap().to_vec().unwrap(), vec![i32::MIN]);

        // the backward pass still seeds and broadcasts ones
        let grads = engine.backward(shifted).unwrap();
        assert_eq!(grads.get(x).unwrap().to_vec().unwrap(), vec![1, 1]);
    }

    #[test]
    fn test_seeded_engines_are_reproducible() {
        let fill = Fill::Normal { mean: 0.0, std: 1.0 };
        let mut first = seeded();
        let mut second = seeded();
        let a = first.tensor(&[8], fill, false).unwrap();
        let b = second.tensor(&[8], fill, false).unwrap();
        assert_eq!(
            first.value(a).unwrap().to_vec().unwrap(),
            second.value(b).unwrap().to_vec().unwrap()
        );
    }
}
