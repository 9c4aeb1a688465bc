use rand::SeedableRng;
use rand::rngs::StdRng;

use fcnet::gradient_check::{DEFAULT_STEP, eval_numerical_gradient_param, rel_error};
use fcnet::{Classifier, FullyConnectedNet, Mode, NetBuilder, NetConfig, Tensor};

fn build(config: NetConfig, seed: u64) -> FullyConnectedNet<f64> {
    NetBuilder::new(config)
        .unwrap()
        .build_with_seed(seed)
        .unwrap()
}

fn check_all_params(net: &mut FullyConnectedNet<f64>, x: &Tensor<f64>, y: &[usize]) {
    let (_, grads) = net.loss(x, y).unwrap();
    assert_eq!(grads.len(), net.params().len());

    let names: Vec<String> = net.params().names().map(str::to_owned).collect();
    for name in names {
        let num = eval_numerical_gradient_param(net, &name, |m| Ok(m.loss(x, y)?.0), DEFAULT_STEP)
            .unwrap();
        let analytic = grads.require(&name).unwrap();
        let rel = rel_error(&num, analytic).unwrap();
        let abs = num.sub(analytic).unwrap().max_abs();
        assert!(
            rel < 1e-5 || abs < 1e-8,
            "{name}: rel error {rel:e}, abs error {abs:e}"
        );
    }
}

#[test]
fn image_shaped_batches_flow_through_the_net() {
    let mut rng = StdRng::seed_from_u64(0);
    let x = Tensor::<f64>::randn(&[3, 3, 2, 2], 1.0, &mut rng);
    let y = [0, 4, 2];

    let mut net = build(
        NetConfig {
            hidden_dims: vec![7],
            input_dim: 12,
            num_classes: 5,
            reg: 0.5,
            weight_scale: 0.1,
            ..NetConfig::default()
        },
        1,
    );
    assert_eq!(net.scores(&x).unwrap().shape(), &[3, 5]);
    check_all_params(&mut net, &x, &y);
}

#[test]
fn deep_batchnorm_net_gradients_match() {
    let mut rng = StdRng::seed_from_u64(2);
    let x = Tensor::<f64>::randn(&[6, 8], 1.0, &mut rng);
    let y = [0, 1, 2, 3, 0, 1];

    let mut net = build(
        NetConfig {
            hidden_dims: vec![10, 9, 8],
            input_dim: 8,
            num_classes: 4,
            reg: 0.1,
            weight_scale: 0.2,
            use_batchnorm: true,
            ..NetConfig::default()
        },
        3,
    );
    check_all_params(&mut net, &x, &y);
}

#[test]
fn training_loss_updates_running_statistics_and_scoring_reads_them() {
    let mut rng = StdRng::seed_from_u64(4);
    let x = Tensor::<f64>::randn(&[16, 5], 2.0, &mut rng).map(|v| v + 3.0);
    let y: Vec<usize> = (0..16).map(|i| i % 3).collect();

    let mut net = build(
        NetConfig {
            hidden_dims: vec![6],
            input_dim: 5,
            num_classes: 3,
            use_batchnorm: true,
            ..NetConfig::default()
        },
        5,
    );
    assert!(net.bn_param(1).unwrap().running_mean().is_none());
    let before = net.scores(&x).unwrap();

    net.loss(&x, &y).unwrap();
    let bn = net.bn_param(1).unwrap();
    assert_eq!(bn.mode, Mode::Train);
    assert!(bn.running_mean().unwrap().max_abs() > 0.0);

    let after = net.scores(&x).unwrap();
    assert_ne!(before, after);
    assert_eq!(after, net.scores(&x).unwrap());
}

#[test]
fn single_precision_loss_is_finite_and_close_to_double() {
    let config = NetConfig {
        hidden_dims: vec![20],
        input_dim: 10,
        num_classes: 4,
        reg: 0.01,
        ..NetConfig::default()
    };
    let net64 = build(config.clone(), 6);
    let mut rng = StdRng::seed_from_u64(7);
    let x64 = Tensor::<f64>::randn(&[8, 10], 1.0, &mut rng);
    let y: Vec<usize> = (0..8).map(|i| i % 4).collect();

    // Same parameters in single precision.
    let mut params32 = fcnet::Params::<f32>::new();
    for (name, t) in net64.params().iter() {
        let data = t.data().iter().map(|&v| v as f32).collect();
        params32.insert(name, Tensor::from_vec(t.shape(), data).unwrap());
    }
    let mut net32 = FullyConnectedNet::<f32>::from_parts(&config, params32).unwrap();
    let x32 = Tensor::<f32>::from_vec(x64.shape(), x64.data().iter().map(|&v| v as f32).collect())
        .unwrap();

    let mut net64 = net64;
    let (l64, _) = net64.loss(&x64, &y).unwrap();
    let (l32, g32) = net32.loss(&x32, &y).unwrap();
    assert!(l32.is_finite());
    assert!((f64::from(l32) - l64).abs() < 1e-4);
    assert!(g32.all_finite());
}
