use std::{
    sync::Arc,
    thread,
    time::Duration,
};

use adapter::{
    AdapterErr, BatchSplitter, BufferPool, DeltaSet, DenseTensor, Evaluation, ExecutionSession,
    GraphLayer, GraphSpec, LayerConfig, LayerGraph, LayerGraphBuilder, PrecisionPolicy,
    SessionOptions, SummaryRecord, SummarySink, TensorBatch, TensorCodec, Telemetry, WeightMap,
    stable_id,
};
use engine::{DType, GraphBuilder, Op, cpu::CpuEngine};
use parking_lot::Mutex;
use rand::{Rng, SeedableRng, rngs::StdRng};

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn mk_bias_add() -> Arc<LayerGraph> {
    let mut builder = LayerGraphBuilder::new(PrecisionPolicy::default());
    let x = builder.input("x", &[2, 2, 3]);
    let bias = DenseTensor::new(vec![3], vec![1., 2., 3.]).unwrap();
    let b = builder.weight("bias", bias);
    builder.op("y", Op::Add, &[&x, &b]);
    builder.output("y");
    Arc::new(builder.build().unwrap())
}

fn mk_dense(single_batch: bool) -> Arc<LayerGraph> {
    let mut builder = LayerGraphBuilder::new(PrecisionPolicy::default());
    let x = builder.input("x", &[3]);
    let w = DenseTensor::new(vec![3, 2], vec![0.1, -0.2, 0.3, 0.4, -0.5, 0.6]).unwrap();
    let w = builder.weight("w", w);
    let b = builder.weight("b", DenseTensor::new(vec![2], vec![0.05, -0.05]).unwrap());

    let matmul = Op::MatMul {
        transpose_a: false,
        transpose_b: false,
    };
    let xw = builder.op("xw", matmul, &[&x, &w]);
    let z = builder.op("z", Op::Add, &[&xw, &b]);
    let y = builder.op("y", Op::Tanh, &[&z]);
    builder.summary("y_summary", &y);
    builder.output("y").single_batch(single_batch);
    Arc::new(builder.build().unwrap())
}

fn mk_layer(engine: &CpuEngine, spec: Arc<LayerGraph>, config: LayerConfig) -> GraphLayer {
    GraphLayer::new("dense", Arc::new(engine.clone()), spec, config).with_isolated_pool()
}

fn random_batch(rng: &mut StdRng, examples: usize, shape: &[usize]) -> TensorBatch {
    let len = shape.iter().product();

    (0..examples)
        .map(|_| {
            let data = (0..len).map(|_| rng.random_range(-1.0..1.0)).collect();
            DenseTensor::new(shape.to_vec(), data).unwrap()
        })
        .collect()
}

/// An input evaluation that copies every gradient it receives into `sink`.
fn recording_input(batch: TensorBatch, sink: &Arc<Mutex<Vec<TensorBatch>>>) -> Evaluation {
    let sink = Arc::clone(sink);

    Evaluation::new(batch, move |_, grad| {
        sink.lock().push(grad.to_vec());
        Ok(())
    })
}

fn delta(deltas: &DeltaSet, weight: &str) -> Vec<f64> {
    deltas
        .entry(stable_id("dense", weight))
        .map(|entry| entry.delta())
        .unwrap_or_default()
}

fn assert_close(a: &[f64], b: &[f64]) {
    assert_eq!(a.len(), b.len());
    for (x, y) in a.iter().zip(b) {
        assert!((x - y).abs() < 1e-9, "{x} != {y}");
    }
}

fn wait_for(cond: impl Fn() -> bool) -> bool {
    for _ in 0..400 {
        if cond() {
            return true;
        }

        thread::sleep(Duration::from_millis(5));
    }

    cond()
}

#[test]
fn bias_add_broadcasts_and_accumulates_per_channel() {
    init();
    let engine = CpuEngine::new();
    let layer = mk_layer(&engine, mk_bias_add(), LayerConfig::default());

    let input = vec![DenseTensor::zeros(&[2, 2, 3]); 2];
    let grads = Arc::new(Mutex::new(Vec::new()));
    let eval = layer.eval(vec![recording_input(input, &grads)]).unwrap();

    assert_eq!(eval.len(), 2);
    for example in eval.data() {
        assert_eq!(example.shape(), [2, 2, 3]);
        for (i, &v) in example.data().iter().enumerate() {
            assert_eq!(v, [1., 2., 3.][i % 3]);
        }
    }

    let deltas = DeltaSet::new();
    eval.backward(&deltas, vec![DenseTensor::filled(&[2, 2, 3], 1.); 2])
        .unwrap();

    // Four positions per example, two examples.
    let entry = deltas.entry(stable_id("dense", "bias")).unwrap();
    assert_eq!(entry.delta(), [8., 8., 8.]);

    let grads = grads.lock();
    assert_eq!(grads.len(), 1);
    assert_eq!(grads[0], vec![DenseTensor::filled(&[2, 2, 3], 1.); 2]);
}

#[test]
fn single_batch_bias_add_contributes_per_example() {
    init();
    let engine = CpuEngine::new();
    let mut builder = LayerGraphBuilder::new(PrecisionPolicy::default());
    let x = builder.input("x", &[2, 2, 3]);
    let b = builder.weight("bias", DenseTensor::new(vec![3], vec![1., 2., 3.]).unwrap());
    builder.op("y", Op::Add, &[&x, &b]);
    builder.output("y").single_batch(true);
    let spec = Arc::new(builder.build().unwrap());

    let codec = TensorCodec::new(Arc::new(BufferPool::default()));
    let mut session = ExecutionSession::new(
        &engine,
        spec.clone(),
        codec.clone(),
        SessionOptions::default(),
    )
    .unwrap();

    let inputs = vec![DenseTensor::zeros(&[2, 2, 3]); 2];
    let dy = vec![DenseTensor::filled(&[2, 2, 3], 1.); 2];
    let mut splitter = BatchSplitter::new(&mut session);
    let pass = splitter.forward(&[&inputs]).unwrap();
    assert_eq!(pass.runs(), 2);

    let grads = splitter.backward(pass, &dy).unwrap();
    assert_eq!(grads.fetches().len(), 2);
    for fetch in grads.fetches() {
        let weights = fetch.weight_gradients(&codec).unwrap();
        assert_eq!(weights[0].0, "bias");
        assert_eq!(weights[0].1.data(), [4., 4., 4.]);
    }

    let layer = mk_layer(&engine, spec, LayerConfig::default());
    let eval = layer.eval(vec![Evaluation::constant(inputs)]).unwrap();

    let deltas = DeltaSet::new();
    eval.backward(&deltas, dy).unwrap();
    assert_eq!(delta(&deltas, "bias"), [8., 8., 8.]);
}

#[test]
fn backward_fetches_inputs_then_weights() {
    init();
    let engine = CpuEngine::new();

    let mut builder = LayerGraphBuilder::new(PrecisionPolicy::default());
    let a = builder.input("a", &[2]);
    let b = builder.input("b", &[2]);
    let scale = builder.weight("scale", DenseTensor::filled(&[2], 2.));
    let shift = builder.weight("shift", DenseTensor::zeros(&[2]));
    let unused = builder.weight("unused", DenseTensor::zeros(&[4]));
    let ab = builder.op("ab", Op::Mul, &[&a, &b]);
    let scaled = builder.op("scaled", Op::Mul, &[&ab, &scale]);
    builder.op("y", Op::Add, &[&scaled, &shift]);
    builder.op("dead", Op::Identity, &[&unused]);
    builder.output("y");
    let spec = Arc::new(builder.build().unwrap());

    let codec = TensorCodec::new(Arc::new(BufferPool::default()));
    let mut session =
        ExecutionSession::new(&engine, spec, codec.clone(), SessionOptions::default()).unwrap();

    let a = vec![DenseTensor::new(vec![2], vec![1., 2.]).unwrap()];
    let b = vec![DenseTensor::new(vec![2], vec![3., 4.]).unwrap()];
    let pass = session.forward(&[&a, &b]).unwrap();
    assert_eq!(pass.output()[0].data(), [6., 16.]);

    let dy = vec![DenseTensor::filled(&[2], 1.)];
    let fetch = session.backward(pass, &dy).unwrap();

    assert_eq!(engine.stats().last_fetches().len(), 2 + 3);
    assert_eq!(fetch.inputs().len(), 2);

    let names: Vec<_> = fetch.weights().iter().map(|(name, _)| name.as_str()).collect();
    assert_eq!(names, ["scale", "shift", "unused"]);

    let inputs = fetch.input_gradients(&codec).unwrap();
    assert_eq!(inputs[0][0].data(), [6., 8.]);
    assert_eq!(inputs[1][0].data(), [2., 4.]);

    let weights = fetch.weight_gradients(&codec).unwrap();
    assert_eq!(weights[0].1.data(), [3., 8.]);
    assert_eq!(weights[1].1.data(), [1., 1.]);
    assert_eq!(weights[2].1.data(), [0.; 4]);
}

#[test]
fn single_batch_splitting_matches_whole_batch() {
    init();
    let engine = CpuEngine::new();
    let mut rng = StdRng::seed_from_u64(42);
    let inputs = random_batch(&mut rng, 3, &[3]);
    let dy = random_batch(&mut rng, 3, &[2]);

    let whole = mk_layer(&engine, mk_dense(false), LayerConfig::default());
    let split = mk_layer(&engine, mk_dense(true), LayerConfig::default());
    let alone = mk_layer(&engine, mk_dense(false), LayerConfig::default());

    let mut results = Vec::new();
    for layer in [&whole, &split] {
        let grads = Arc::new(Mutex::new(Vec::new()));
        let eval = layer.eval(vec![recording_input(inputs.clone(), &grads)]).unwrap();
        let output = eval.data().clone();

        let deltas = DeltaSet::new();
        eval.backward(&deltas, dy.clone()).unwrap();

        let input_grads = grads.lock().remove(0);
        results.push((output, input_grads, delta(&deltas, "w"), delta(&deltas, "b")));
    }

    let alone_deltas = DeltaSet::new();
    for i in 0..inputs.len() {
        let grads = Arc::new(Mutex::new(Vec::new()));
        let eval = alone
            .eval(vec![recording_input(inputs[i..=i].to_vec(), &grads)])
            .unwrap();

        let (output, input_grads, ..) = &results[1];
        assert_close(eval.data()[0].data(), output[i].data());

        eval.backward(&alone_deltas, dy[i..=i].to_vec()).unwrap();
        assert_close(grads.lock()[0][0].data(), input_grads[i].data());
    }

    let (whole, split) = (&results[0], &results[1]);
    assert_eq!(split.0.len(), 3);
    for (a, b) in whole.0.iter().zip(&split.0) {
        assert_close(a.data(), b.data());
    }
    for (a, b) in whole.1.iter().zip(&split.1) {
        assert_close(a.data(), b.data());
    }

    assert_close(&whole.2, &split.2);
    assert_close(&whole.3, &split.3);
    assert_close(&split.2, &delta(&alone_deltas, "w"));
    assert_close(&split.3, &delta(&alone_deltas, "b"));
}

#[test]
fn split_batches_fail_as_a_whole() {
    init();
    let engine = CpuEngine::new();
    let layer = mk_layer(&engine, mk_dense(true), LayerConfig::default());

    let mut batch = vec![DenseTensor::zeros(&[3]); 2];
    batch.push(DenseTensor::zeros(&[4]));

    let res = layer.eval(vec![Evaluation::constant(batch)]);
    assert!(matches!(res, Err(AdapterErr::ShapeMismatch { .. })));
    assert_eq!(layer.codec().pool().stats().outstanding, 0);
}

#[test]
fn failed_example_backward_aborts_the_call() {
    init();
    let engine = CpuEngine::new();
    let layer = mk_layer(&engine, mk_dense(true), LayerConfig::default());

    let grads = Arc::new(Mutex::new(Vec::new()));
    let input = recording_input(vec![DenseTensor::zeros(&[3]); 3], &grads);
    let eval = layer.eval(vec![input]).unwrap();

    let dy = vec![
        DenseTensor::filled(&[2], 1.),
        DenseTensor::filled(&[3], 1.),
        DenseTensor::filled(&[2], 1.),
    ];
    let deltas = DeltaSet::new();
    let res = eval.backward(&deltas, dy);

    assert!(matches!(res, Err(AdapterErr::ShapeMismatch { .. })));
    assert!(grads.lock().is_empty());
    assert!(deltas.is_empty());
    assert_eq!(layer.codec().pool().stats().outstanding, 0);
}

#[test]
fn layers_on_separate_threads_share_one_pool() {
    init();
    let engine = CpuEngine::new();
    let pool = Arc::new(BufferPool::default());
    let mut rng = StdRng::seed_from_u64(21);
    let inputs = random_batch(&mut rng, 4, &[3]);
    let dy = random_batch(&mut rng, 4, &[2]);

    let results: Vec<_> = thread::scope(|scope| {
        let workers: Vec<_> = [false, true]
            .into_iter()
            .map(|single_batch| {
                let layer = GraphLayer::new(
                    "dense",
                    Arc::new(engine.clone()),
                    mk_dense(single_batch),
                    LayerConfig::default(),
                )
                .with_pool(Arc::clone(&pool));
                let (inputs, dy) = (&inputs, &dy);

                scope.spawn(move || {
                    let deltas = DeltaSet::new();
                    for _ in 0..25 {
                        let eval = layer.eval(vec![Evaluation::constant(inputs.clone())]).unwrap();
                        eval.backward(&deltas, dy.clone()).unwrap();
                    }
                    (delta(&deltas, "w"), delta(&deltas, "b"))
                })
            })
            .collect();

        workers.into_iter().map(|w| w.join().unwrap()).collect()
    });

    assert_close(&results[0].0, &results[1].0);
    assert_close(&results[0].1, &results[1].1);
    assert_eq!(pool.stats().outstanding, 0);
    assert!(pool.stats().idle > 0);
}

#[test]
fn empty_batches_are_rejected() {
    init();
    let engine = CpuEngine::new();

    for single_batch in [false, true] {
        let layer = mk_layer(&engine, mk_dense(single_batch), LayerConfig::default());
        let res = layer.eval(vec![Evaluation::constant(Vec::new())]);
        assert!(matches!(res, Err(AdapterErr::EmptyBatch)));
    }
}

#[test]
fn callbacks_keeping_their_gradient_are_reported() {
    init();
    let engine = CpuEngine::new();
    let layer = mk_layer(&engine, mk_dense(false), LayerConfig::default());

    let stash = Arc::new(Mutex::new(None));
    let inner = Arc::clone(&stash);
    let input = Evaluation::new(vec![DenseTensor::zeros(&[3])], move |_, grad| {
        *inner.lock() = Some(grad);
        Ok(())
    });

    let eval = layer.eval(vec![input]).unwrap();
    let res = eval.backward(&DeltaSet::new(), vec![DenseTensor::filled(&[2], 1.)]);

    assert!(matches!(res, Err(AdapterErr::Consistency { input: 0, held: 1 })));
    assert!(stash.lock().is_some());
}

#[test]
fn native_resources_are_torn_down() {
    init();
    let engine = CpuEngine::new();
    let layer = mk_layer(&engine, mk_dense(false), LayerConfig::default());
    let inputs = vec![DenseTensor::zeros(&[3]); 4];

    let eval = layer.eval(vec![Evaluation::constant(inputs.clone())]).unwrap();
    assert_eq!(engine.stats().live_graphs(), 1);
    eval.backward(&DeltaSet::new(), vec![DenseTensor::zeros(&[2]); 4])
        .unwrap();

    assert!(wait_for(|| engine.stats().live_graphs() == 0));
    assert!(wait_for(|| engine.stats().live_runtimes() == 0));

    let config = LayerConfig {
        background_teardown: false,
        ..LayerConfig::default()
    };
    let layer = mk_layer(&engine, mk_dense(false), config);
    let eval = layer.eval(vec![Evaluation::constant(inputs)]).unwrap();
    assert_eq!(engine.stats().live_graphs(), 1);

    drop(eval);
    assert_eq!(engine.stats().live_graphs(), 0);
    assert_eq!(engine.stats().live_runtimes(), 0);
    assert_eq!(layer.codec().pool().stats().outstanding, 0);
}

#[test]
fn summaries_reach_the_telemetry_sink() {
    init();

    #[derive(Default)]
    struct Collect(Mutex<Vec<(u64, SummaryRecord)>>);

    impl SummarySink for Collect {
        fn record(&self, step: u64, record: &SummaryRecord) {
            self.0.lock().push((step, record.clone()));
        }
    }

    let engine = CpuEngine::new();
    let sink = Arc::new(Collect::default());
    let telemetry = Telemetry::new(sink.clone());
    let layer = mk_layer(&engine, mk_dense(true), LayerConfig::default())
        .with_telemetry(telemetry.clone());

    telemetry.set_step(5);
    layer
        .eval(vec![Evaluation::constant(vec![DenseTensor::zeros(&[3]); 2])])
        .unwrap();

    let records = sink.0.lock();
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|(step, r)| *step == 5 && r.tag == "y_summary"));
    assert_eq!(records[0].1.count, 2.);
}

/// A spec over raw graph bytes.
struct RawSpec {
    bytes: Vec<u8>,
    inputs: Vec<String>,
    weights: WeightMap,
}

impl GraphSpec for RawSpec {
    fn graph_def(&self) -> adapter::Result<Vec<u8>> {
        Ok(self.bytes.clone())
    }

    fn input_nodes(&self) -> &[String] {
        &self.inputs
    }

    fn output_node(&self) -> &str {
        "y"
    }

    fn summary_node(&self) -> Option<&str> {
        None
    }

    fn is_single_batch(&self) -> bool {
        false
    }

    fn precision(&self, _node: &str) -> DType {
        DType::F64
    }

    fn weights(&self) -> &WeightMap {
        &self.weights
    }
}

fn open(engine: &CpuEngine, bytes: Vec<u8>) -> adapter::Result<ExecutionSession> {
    let spec = RawSpec {
        bytes,
        inputs: vec!["x".to_string()],
        weights: WeightMap::new(),
    };
    let codec = TensorCodec::new(Arc::new(BufferPool::default()));

    ExecutionSession::new(engine, Arc::new(spec), codec, SessionOptions::default())
}

#[test]
fn import_failures_are_classified() {
    init();
    let engine = CpuEngine::new();

    let res = open(&engine, b"not a graph".to_vec());
    assert!(matches!(res, Err(AdapterErr::GraphImport(_))));

    let json = r#"{ "nodes": [
        { "name": "x", "op": { "kind": "placeholder" }, "dtype": "int32" },
        { "name": "y", "op": { "kind": "identity" }, "inputs": ["x"], "dtype": "int32" }
    ] }"#;
    let res = open(&engine, json.as_bytes().to_vec());
    assert!(matches!(res, Err(AdapterErr::UnsupportedDType(tag)) if tag == "int32"));
    assert_eq!(engine.stats().live_graphs(), 0);
}

#[test]
fn conflicting_gradient_nodes_fail_wiring() {
    init();
    let engine = CpuEngine::new();

    let mut builder = GraphBuilder::new();
    let x = builder.placeholder("x", DType::F64, Some(&[-1, 2]));
    builder.op("y", Op::Tanh, &[&x], DType::F64);
    builder.placeholder("y_delta", DType::F64, None);
    let bytes = builder.build().to_bytes().unwrap();

    let mut session = open(&engine, bytes).unwrap();
    let x = vec![DenseTensor::zeros(&[2])];
    let pass = session.forward(&[&x]).unwrap();

    let res = session.backward(pass, &[DenseTensor::zeros(&[2])]);
    assert!(matches!(res, Err(AdapterErr::GradientWiring { node, .. }) if node == "y_delta"));
}
