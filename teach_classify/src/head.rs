//! Trainable classifier head.
//!
//! `dense(D → hidden, relu) → dropout → dense(hidden → C) → softmax`, trained with categorical
//! cross-entropy and Adam on flattened embeddings. The network runs on burn's ndarray backend;
//! between fits the weights are kept as plain [`HeadParams`] so a head can be shared across
//! threads and persisted without a recorder.
use burn::{
    module::{Module, Param},
    nn::{
        loss::CrossEntropyLossConfig, Dropout, DropoutConfig, Initializer, Linear, LinearConfig,
        Relu,
    },
    optim::{AdamConfig, GradientsParams, Optimizer},
    tensor::{activation::softmax, backend::Backend, Int, Tensor, TensorData},
};
use burn_autodiff::Autodiff;
use burn_ndarray::{NdArray, NdArrayDevice};
use ndarray::{Array1, Array2, ArrayView1, Axis};
use rand::{seq::SliceRandom, Rng};
use serde::{Deserialize, Serialize};

use crate::{tensor::Tracked, Error, Matrix, Result};

/// Backend for prediction.
type Infer = NdArray<f32>;
/// Backend for fitting.
type Train = Autodiff<Infer>;

/// Learned parameters, serializable for persistence.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct HeadParams {
    /// Hidden kernel `[D, hidden]`.
    pub w1: Array2<f32>,
    pub b1: Array1<f32>,
    /// Output kernel `[hidden, C]`.
    pub w2: Array2<f32>,
    pub b2: Array1<f32>,
    /// Dropout rate applied to the hidden activations while fitting.
    pub dropout: f32,
}

/// Hyperparameters of one fit.
#[derive(Clone, Copy, Debug)]
pub struct FitOptions {
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f32,
}

/// Statistics of one completed epoch.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct EpochStats {
    /// 1-based epoch number.
    pub epoch: usize,
    pub total_epochs: usize,
    /// Mean cross-entropy over all samples.
    pub loss: f32,
    /// Fraction of samples whose argmax matched the label during the epoch.
    pub accuracy: f32,
}

/// The head as a burn module. Dropout is only active on an autodiff backend.
#[derive(Module, Debug)]
struct HeadNet<B: Backend> {
    hidden: Linear<B>,
    dropout: Dropout,
    output: Linear<B>,
    activation: Relu,
}

impl<B: Backend> HeadNet<B> {
    /// Logits `[M, C]`.
    fn forward(&self, embeddings: Tensor<B, 2>) -> Tensor<B, 2> {
        let x = self.hidden.forward(embeddings);
        let x = self.activation.forward(x);
        let x = self.dropout.forward(x);
        self.output.forward(x)
    }
}

#[derive(Debug)]
pub struct ClassifierHead {
    params: HeadParams,
}

impl ClassifierHead {
    /// Build an untrained head with Glorot-uniform kernels and zero biases.
    ///
    /// Initialization draws from the backend generator, which is reseeded from `rng` first.
    pub fn build<R: Rng + ?Sized>(
        input_width: usize,
        num_classes: usize,
        hidden_units: usize,
        dropout: f32,
        rng: &mut R,
    ) -> Result<Self> {
        let device = NdArrayDevice::default();
        Infer::seed(&device, rng.gen());

        let dense = |d_input, d_output| {
            LinearConfig::new(d_input, d_output)
                .with_initializer(Initializer::XavierUniform { gain: 1.0 })
                .init::<Infer>(&device)
        };
        let net = HeadNet {
            hidden: dense(input_width, hidden_units),
            dropout: DropoutConfig::new(dropout as f64).init(),
            output: dense(hidden_units, num_classes),
            activation: Relu::new(),
        };

        let mut params = export(&net, dropout)?;
        params.b1.fill(0.0);
        params.b2.fill(0.0);

        Ok(Self { params })
    }

    /// Restore a head from stored parameters.
    pub fn from_params(params: HeadParams) -> Result<Self> {
        let (input_width, hidden) = params.w1.dim();
        let consistent = params.b1.len() == hidden
            && params.w2.nrows() == hidden
            && params.b2.len() == params.w2.ncols()
            && input_width > 0
            && params.w2.ncols() > 0
            && (0.0..1.0).contains(&params.dropout);

        match consistent {
            true => Ok(Self { params }),
            false => Err(Error::mismatch(format!(
                "inconsistent head parameters: w1 {:?}, b1 {}, w2 {:?}, b2 {}, dropout {}",
                params.w1.dim(),
                params.b1.len(),
                params.w2.dim(),
                params.b2.len(),
                params.dropout
            ))),
        }
    }

    /// Current weights.
    pub fn params(&self) -> &HeadParams {
        &self.params
    }

    pub fn input_width(&self) -> usize {
        self.params.w1.nrows()
    }

    pub fn num_classes(&self) -> usize {
        self.params.w2.ncols()
    }

    /// Class probabilities `[M, C]` for embeddings `[M, D]`. Rows sum to one.
    pub fn predict(&self, embeddings: &Array2<f32>) -> Result<Matrix> {
        self.check_width(embeddings)?;
        let device = NdArrayDevice::default();
        let net = self.net::<Infer>(&device);

        let logits = net.forward(to_tensor(embeddings, &device));
        let probabilities = to_array(softmax(logits, 1))?;

        Ok(Tracked::new(probabilities))
    }

    /// Fit on embeddings `[N, D]` against one-hot labels `[N, C]`.
    ///
    /// Samples are reshuffled every epoch and dropout masks come from the backend generator,
    /// reseeded from `rng`. Fails without touching the outcome of earlier fits if the loss
    /// stops being finite.
    pub fn fit<R: Rng + ?Sized>(
        &mut self,
        embeddings: &Array2<f32>,
        one_hot: &Array2<f32>,
        options: FitOptions,
        rng: &mut R,
    ) -> Result<Vec<EpochStats>> {
        self.check_width(embeddings)?;
        let n = embeddings.nrows();
        if one_hot.dim() != (n, self.num_classes()) {
            return Err(Error::mismatch(format!(
                "labels {:?} do not match {} samples of {} classes",
                one_hot.dim(),
                n,
                self.num_classes()
            )));
        }
        if n == 0 {
            return Err(Error::mismatch("cannot fit on an empty dataset"));
        }

        let device = NdArrayDevice::default();
        Train::seed(&device, rng.gen());
        let targets: Vec<usize> = one_hot.axis_iter(Axis(0)).map(|y| argmax(y).0).collect();

        let mut net = self.net::<Train>(&device);
        let mut optimizer = AdamConfig::new()
            .with_epsilon(1.0e-7)
            .init::<Train, HeadNet<Train>>();
        let loss_fn = CrossEntropyLossConfig::new().init(&device);
        let mut order: Vec<usize> = (0..n).collect();
        let mut history = Vec::with_capacity(options.epochs);

        for epoch in 1..=options.epochs {
            order.shuffle(rng);

            let mut loss = 0.0;
            let mut correct = 0;
            for batch in order.chunks(options.batch_size.max(1)) {
                let xb = to_tensor(&embeddings.select(Axis(0), batch), &device);
                let yb: Vec<i64> = batch.iter().map(|&i| targets[i] as i64).collect();
                let yb = Tensor::<Train, 1, Int>::from_data(
                    TensorData::new(yb, [batch.len()]),
                    &device,
                );

                let logits = net.forward(xb);
                correct += to_array(logits.clone())?
                    .axis_iter(Axis(0))
                    .zip(batch)
                    .filter(|(row, i)| argmax(row.view()).0 == targets[**i])
                    .count();
                let batch_loss = loss_fn.forward(logits, yb);
                // Mean over the batch; summed here, averaged per epoch
                loss += scalar(batch_loss.clone())? * batch.len() as f32;

                let grads = GradientsParams::from_grads(batch_loss.backward(), &net);
                net = optimizer.step(options.learning_rate as f64, net, grads);
            }

            let stats = EpochStats {
                epoch,
                total_epochs: options.epochs,
                loss: loss / n as f32,
                accuracy: correct as f32 / n as f32,
            };
            if !stats.loss.is_finite() {
                return Err(Error::Inference(format!(
                    "training diverged in epoch {epoch}"
                )));
            }
            log::info!(
                "Epoch {}/{}: loss {:.4}, accuracy {:.3}",
                stats.epoch,
                stats.total_epochs,
                stats.loss,
                stats.accuracy
            );
            history.push(stats);
        }

        self.params = export(&net, self.params.dropout)?;
        Ok(history)
    }

    /// The stored weights as a burn module on backend `B`.
    fn net<B: Backend>(&self, device: &B::Device) -> HeadNet<B> {
        let p = &self.params;
        HeadNet {
            hidden: dense_from(&p.w1, &p.b1, device),
            dropout: DropoutConfig::new(p.dropout as f64).init(),
            output: dense_from(&p.w2, &p.b2, device),
            activation: Relu::new(),
        }
    }

    fn check_width(&self, embeddings: &Array2<f32>) -> Result<()> {
        match embeddings.ncols() == self.input_width() {
            true => Ok(()),
            false => Err(Error::mismatch(format!(
                "embedding width {} does not match head input width {}",
                embeddings.ncols(),
                self.input_width()
            ))),
        }
    }
}

/// Index of the largest value; the lowest index wins ties.
pub(crate) fn argmax(row: ArrayView1<f32>) -> (usize, f32) {
    row.iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |best, (i, &v)| match v > best.1 {
            true => (i, v),
            false => best,
        })
}

fn dense_from<B: Backend>(
    kernel: &Array2<f32>,
    bias: &Array1<f32>,
    device: &B::Device,
) -> Linear<B> {
    let (d_input, d_output) = kernel.dim();
    let mut linear = LinearConfig::new(d_input, d_output).init(device);
    linear.weight = Param::from_tensor(to_tensor(kernel, device));
    linear.bias = Some(Param::from_tensor(Tensor::from_data(
        TensorData::new(bias.to_vec(), [bias.len()]),
        device,
    )));
    linear
}

/// Weights of `net` as plain arrays.
fn export<B: Backend>(net: &HeadNet<B>, dropout: f32) -> Result<HeadParams> {
    let bias = |linear: &Linear<B>, width: usize| -> Result<Array1<f32>> {
        match &linear.bias {
            Some(bias) => Ok(Array1::from(values(bias.val().into_data())?)),
            None => Ok(Array1::zeros(width)),
        }
    };
    let w1 = to_array(net.hidden.weight.val())?;
    let w2 = to_array(net.output.weight.val())?;

    Ok(HeadParams {
        b1: bias(&net.hidden, w1.ncols())?,
        b2: bias(&net.output, w2.ncols())?,
        w1,
        w2,
        dropout,
    })
}

fn to_tensor<B: Backend>(array: &Array2<f32>, device: &B::Device) -> Tensor<B, 2> {
    let values = array.iter().copied().collect::<Vec<_>>();
    Tensor::from_data(TensorData::new(values, [array.nrows(), array.ncols()]), device)
}

fn to_array<B: Backend>(tensor: Tensor<B, 2>) -> Result<Array2<f32>> {
    let [rows, cols] = tensor.dims();
    Array2::from_shape_vec((rows, cols), values(tensor.into_data())?)
        .map_err(|e| Error::Inference(format!("unexpected tensor layout: {e}")))
}

fn scalar<B: Backend>(tensor: Tensor<B, 1>) -> Result<f32> {
    values(tensor.into_data())?
        .first()
        .copied()
        .ok_or_else(|| Error::Inference("empty loss tensor".into()))
}

fn values(data: TensorData) -> Result<Vec<f32>> {
    data.to_vec::<f32>()
        .map_err(|e| Error::Inference(format!("unreadable tensor data: {e:?}")))
}

#[cfg(test)]
mod test {
    use ndarray::array;
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;

    fn two_clusters() -> (Array2<f32>, Array2<f32>) {
        let x = array![
            [1.0, 0.1, 0.0],
            [0.9, 0.0, 0.1],
            [0.8, 0.2, 0.0],
            [0.0, 0.1, 1.0],
            [0.1, 0.0, 0.9],
            [0.0, 0.2, 0.8],
        ];
        let y = array![
            [1.0, 0.0],
            [1.0, 0.0],
            [1.0, 0.0],
            [0.0, 1.0],
            [0.0, 1.0],
            [0.0, 1.0],
        ];
        (x, y)
    }

    #[test]
    fn predictions_are_probability_rows() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(1);
        let head = ClassifierHead::build(3, 4, 8, 0.2, &mut rng)?;
        let (x, _) = two_clusters();

        let probs = head.predict(&x)?;

        assert_eq!(probs.dim(), (6, 4));
        for row in probs.axis_iter(Axis(0)) {
            assert!(row.iter().all(|p| *p >= 0.0));
            assert!((row.sum() - 1.0).abs() < 1e-5);
        }

        Ok(())
    }

    #[test]
    fn built_head_has_requested_shape() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(8);
        let head = ClassifierHead::build(5, 3, 7, 0.1, &mut rng)?;

        assert_eq!(head.params().w1.dim(), (5, 7));
        assert_eq!(head.params().b1.len(), 7);
        assert_eq!(head.params().w2.dim(), (7, 3));
        assert_eq!(head.params().b2.len(), 3);
        assert!(head.params().w1.iter().any(|w| *w != 0.0));
        assert!(head.params().b2.iter().all(|b| *b == 0.0));

        Ok(())
    }

    #[test]
    fn hand_set_weights_give_expected_probabilities() -> Result<()> {
        // One hidden unit summing the inputs; logits [1 - s, s - 1]
        let head = ClassifierHead::from_params(HeadParams {
            w1: array![[1.0], [1.0]],
            b1: array![0.0],
            w2: array![[-1.0, 1.0]],
            b2: array![1.0, -1.0],
            dropout: 0.5,
        })?;

        let probs = head.predict(&array![[0.5, 0.5], [1.0, 1.0]])?;

        assert!((probs[[0, 0]] - 0.5).abs() < 1e-6);
        let expected = 1.0 / (1.0 + (-2.0f32).exp());
        assert!((probs[[1, 1]] - expected).abs() < 1e-5);

        Ok(())
    }

    #[test]
    fn predict_has_no_dropout() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(2);
        let head = ClassifierHead::build(3, 2, 8, 0.5, &mut rng)?;
        let (x, _) = two_clusters();

        assert_eq!(*head.predict(&x)?, *head.predict(&x)?);

        Ok(())
    }

    #[test]
    fn width_mismatch_is_reported() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(3);
        let head = ClassifierHead::build(5, 2, 8, 0.2, &mut rng)?;
        let (x, _) = two_clusters();

        assert!(matches!(
            head.predict(&x),
            Err(Error::ConfigurationMismatch(reason)) if reason.contains("width 3")
        ));

        Ok(())
    }

    #[test]
    fn fit_separates_two_clusters() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(4);
        let mut head = ClassifierHead::build(3, 2, 16, 0.2, &mut rng)?;
        let (x, y) = two_clusters();
        let options = FitOptions {
            epochs: 60,
            batch_size: 4,
            learning_rate: 0.01,
        };

        let history = head.fit(&x, &y, options, &mut rng)?;

        assert_eq!(history.len(), 60);
        assert!(history[59].loss < history[0].loss);
        let probs = head.predict(&x)?;
        for (row, label) in probs.axis_iter(Axis(0)).zip([0, 0, 0, 1, 1, 1]) {
            assert_eq!(argmax(row).0, label);
        }

        Ok(())
    }

    #[test]
    fn fit_rejects_label_mismatch() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(5);
        let mut head = ClassifierHead::build(3, 3, 4, 0.0, &mut rng)?;
        let before = head.params().clone();
        let (x, y) = two_clusters();
        let options = FitOptions {
            epochs: 1,
            batch_size: 2,
            learning_rate: 0.01,
        };

        assert!(head.fit(&x, &y, options, &mut rng).is_err());
        assert_eq!(*head.params(), before);

        Ok(())
    }

    #[test]
    fn inconsistent_params_are_rejected() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(6);
        let mut params = ClassifierHead::build(3, 2, 4, 0.2, &mut rng)?.params().clone();
        assert!(ClassifierHead::from_params(params.clone()).is_ok());

        params.b2 = Array1::zeros(5);
        assert!(ClassifierHead::from_params(params).is_err());

        Ok(())
    }

    #[test]
    fn argmax_prefers_lowest_index_on_ties() {
        assert_eq!(argmax(array![0.25, 0.5, 0.5, 0.1].view()), (1, 0.5));
    }
}
