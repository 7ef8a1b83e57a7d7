//! Gradient control: norms, clipping, accumulation, SVRG correction and
//! gradient-moment diagnostics.
//!
//! Every helper walks the module with a [`ModuleVisitor`], so parameters are
//! visited in declaration order and looked up in [`GradientsParams`] by
//! [`ParamId`]. Parameters without a gradient are skipped everywhere.

use std::collections::HashSet;
use std::marker::PhantomData;

use burn::module::{Module, ModuleVisitor, ParamId};
use burn::optim::GradientsParams;
use burn::tensor::{
    backend::{AutodiffBackend, Backend},
    ElementConversion, Tensor,
};
use serde::{Deserialize, Serialize};

struct SquaredNormVisitor<'a, B: AutodiffBackend> {
    grads: &'a GradientsParams,
    sum: f64,
    phantom: PhantomData<B>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for SquaredNormVisitor<'_, B> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, _tensor: &Tensor<B, D>) {
        if let Some(grad) = self.grads.get::<B::InnerBackend, D>(id) {
            self.sum += grad.powf_scalar(2.0).sum().into_scalar().elem::<f64>();
        }
    }
}

/// Euclidean norm over the concatenation of all present parameter gradients.
pub fn grad_norm<B: AutodiffBackend, M: Module<B>>(module: &M, grads: &GradientsParams) -> f64 {
    let mut visitor = SquaredNormVisitor::<B> {
        grads,
        sum: 0.0,
        phantom: PhantomData,
    };
    module.visit(&mut visitor);
    visitor.sum.sqrt()
}

struct ScaleVisitor<'a, B: AutodiffBackend> {
    grads: &'a mut GradientsParams,
    factor: f64,
    phantom: PhantomData<B>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for ScaleVisitor<'_, B> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, _tensor: &Tensor<B, D>) {
        if let Some(grad) = self.grads.remove::<B::InnerBackend, D>(id) {
            self.grads
                .register::<B::InnerBackend, D>(id, grad.mul_scalar(self.factor));
        }
    }
}

/// Multiply every present gradient by `factor`.
pub fn scale_gradients<B: AutodiffBackend, M: Module<B>>(
    module: &M,
    mut grads: GradientsParams,
    factor: f64,
) -> GradientsParams {
    let mut visitor = ScaleVisitor::<B> {
        grads: &mut grads,
        factor,
        phantom: PhantomData,
    };
    module.visit(&mut visitor);
    grads
}

/// Clip gradients to a global Euclidean norm of `max_norm`.
///
/// Returns the (possibly rescaled) gradients and the norm measured before
/// clipping. A non-positive `max_norm` disables clipping: the gradients are
/// handed back untouched.
pub fn clip_grad_norm<B: AutodiffBackend, M: Module<B>>(
    module: &M,
    grads: GradientsParams,
    max_norm: f64,
) -> (GradientsParams, f64) {
    let norm = grad_norm(module, &grads);
    if max_norm <= 0.0 {
        return (grads, norm);
    }
    let coefficient = max_norm / (norm + 1e-6);
    if coefficient >= 1.0 {
        return (grads, norm);
    }
    (scale_gradients(module, grads, coefficient), norm)
}

struct AccumulateVisitor<'a, B: AutodiffBackend> {
    total: &'a mut GradientsParams,
    incoming: &'a mut GradientsParams,
    phantom: PhantomData<B>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for AccumulateVisitor<'_, B> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, _tensor: &Tensor<B, D>) {
        if let Some(grad) = self.incoming.remove::<B::InnerBackend, D>(id) {
            let sum = match self.total.remove::<B::InnerBackend, D>(id) {
                Some(previous) => previous + grad,
                None => grad,
            };
            self.total.register::<B::InnerBackend, D>(id, sum);
        }
    }
}

/// Add `incoming` into `total`, parameter by parameter.
pub fn accumulate_gradients<B: AutodiffBackend, M: Module<B>>(
    module: &M,
    total: Option<GradientsParams>,
    mut incoming: GradientsParams,
) -> GradientsParams {
    let Some(mut total) = total else {
        return incoming;
    };
    let mut visitor = AccumulateVisitor::<B> {
        total: &mut total,
        incoming: &mut incoming,
        phantom: PhantomData,
    };
    module.visit(&mut visitor);
    total
}

/// Ordered `(id, shape)` listing of a module's float parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamLayout {
    pub entries: Vec<(ParamId, Vec<usize>)>,
}

struct LayoutVisitor<B: Backend> {
    entries: Vec<(ParamId, Vec<usize>)>,
    phantom: PhantomData<B>,
}

impl<B: Backend> ModuleVisitor<B> for LayoutVisitor<B> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, tensor: &Tensor<B, D>) {
        self.entries.push((id, tensor.dims().to_vec()));
    }
}

impl ParamLayout {
    pub fn of<B: Backend, M: Module<B>>(module: &M) -> Self {
        let mut visitor = LayoutVisitor::<B> {
            entries: Vec::new(),
            phantom: PhantomData,
        };
        module.visit(&mut visitor);
        Self {
            entries: visitor.entries,
        }
    }

    pub fn num_elements(&self) -> usize {
        self.entries
            .iter()
            .map(|(_, shape)| shape.iter().product::<usize>())
            .sum()
    }
}

/// # Panics
///
/// Panics with `LAYOUT ERROR` unless both layouts list the same parameters,
/// in the same order, with the same shapes.
pub fn assert_same_layout(local: &ParamLayout, global: &ParamLayout) {
    if local.entries.len() != global.entries.len() {
        panic!(
            "LAYOUT ERROR: local model has {} parameters, global snapshot has {}",
            local.entries.len(),
            global.entries.len()
        );
    }
    for (position, ((id_l, shape_l), (id_g, shape_g))) in
        local.entries.iter().zip(&global.entries).enumerate()
    {
        if id_l != id_g {
            panic!(
                "LAYOUT ERROR: parameter {} is {:?} in the local model but {:?} in the global snapshot",
                position, id_l, id_g
            );
        }
        if shape_l != shape_g {
            panic!(
                "LAYOUT ERROR: parameter {} ({:?}) has shape {:?} locally but {:?} in the global snapshot",
                position, id_l, shape_l, shape_g
            );
        }
    }
}

struct SvrgVisitor<'a, B: AutodiffBackend> {
    local: &'a mut GradientsParams,
    global_at_batch: &'a GradientsParams,
    global_average: &'a GradientsParams,
    phantom: PhantomData<B>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for SvrgVisitor<'_, B> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, _tensor: &Tensor<B, D>) {
        let Some(local) = self.local.remove::<B::InnerBackend, D>(id) else {
            return;
        };
        let global = self
            .global_at_batch
            .get::<B::InnerBackend, D>(id)
            .unwrap_or_else(|| {
                panic!("SVRG ERROR: global snapshot produced no gradient for parameter {:?}", id)
            });
        let average = self
            .global_average
            .get::<B::InnerBackend, D>(id)
            .unwrap_or_else(|| {
                panic!("SVRG ERROR: no averaged global gradient for parameter {:?}", id)
            });
        if local.dims() != global.dims() || local.dims() != average.dims() {
            panic!(
                "SVRG ERROR: gradient shapes differ for parameter {:?}: local {:?}, global {:?}, average {:?}",
                id,
                local.dims(),
                global.dims(),
                average.dims()
            );
        }
        // Drift term first so a zero drift leaves the local gradient bit-identical.
        let corrected = local + (average - global);
        self.local.register::<B::InnerBackend, D>(id, corrected);
    }
}

/// SVRG control-variate correction:
/// `g_local - g_global_at_same_point + g_global_average`.
///
/// # Panics
///
/// Panics with `SVRG ERROR` if a parameter with a local gradient has no
/// global gradient at the batch or no averaged global gradient, or if the
/// three gradients differ in shape.
pub fn svrg_correct<B: AutodiffBackend, M: Module<B>>(
    local_module: &M,
    mut local: GradientsParams,
    global_at_batch: &GradientsParams,
    global_average: &GradientsParams,
) -> GradientsParams {
    let mut visitor = SvrgVisitor::<B> {
        local: &mut local,
        global_at_batch,
        global_average,
        phantom: PhantomData,
    };
    local_module.visit(&mut visitor);
    local
}

/// Summary of per-parameter gradient moments over one epoch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MomentReport {
    /// Sum of the second raw moment over all parameters.
    pub srm_g: f64,
    /// Norm of the mean-gradient vector.
    pub mean_g_norm: f64,
    /// Sum of `second_raw_moment - first_moment^2`.
    pub var_g: f64,
    /// Mean of `|first| / (sqrt(second) + 1e-6)` over all parameters.
    pub uncertainty: f64,
    pub batches: usize,
}

impl MomentReport {
    pub fn scalars(&self) -> [(&'static str, f64); 4] {
        [
            ("srm_g", self.srm_g),
            ("mean_g_norm", self.mean_g_norm),
            ("var_g", self.var_g),
            ("uncertainty", self.uncertainty),
        ]
    }
}

/// First and second raw gradient moments in two flat buffers.
///
/// Buffers are sized to every trainable scalar of the module. Included
/// parameters occupy consecutive offset ranges in declaration order;
/// excluded parameters (typically the classifier head) are never written,
/// so the tail of the buffers stays zero.
#[derive(Debug, Clone)]
pub struct GradientMoments {
    first: Vec<f64>,
    second: Vec<f64>,
    excluded: HashSet<ParamId>,
    batches: usize,
}

struct MomentVisitor<'a, B: AutodiffBackend> {
    moments: &'a mut GradientMoments,
    grads: &'a GradientsParams,
    offset: usize,
    phantom: PhantomData<B>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for MomentVisitor<'_, B> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, tensor: &Tensor<B, D>) {
        if self.moments.excluded.contains(&id) {
            return;
        }
        let numel = tensor.shape().num_elements();
        let end = self.offset + numel;
        if end > self.moments.first.len() {
            panic!(
                "MOMENT ERROR: parameter {:?} needs buffer range {}..{} but buffers hold {} entries",
                id,
                self.offset,
                end,
                self.moments.first.len()
            );
        }
        if let Some(grad) = self.grads.get::<B::InnerBackend, D>(id) {
            let range = self.offset..end;
            let data = grad.to_data();
            for ((first, second), g) in self.moments.first[range.clone()]
                .iter_mut()
                .zip(&mut self.moments.second[range])
                .zip(data.iter::<f32>())
            {
                let g = g as f64;
                *first += g;
                *second += g * g;
            }
        }
        self.offset = end;
    }
}

impl GradientMoments {
    pub fn new<B: Backend, M: Module<B>>(
        module: &M,
        excluded: impl IntoIterator<Item = ParamId>,
    ) -> Self {
        let n_param = ParamLayout::of::<B, M>(module).num_elements();
        Self {
            first: vec![0.0; n_param],
            second: vec![0.0; n_param],
            excluded: excluded.into_iter().collect(),
            batches: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.first.len()
    }

    pub fn is_empty(&self) -> bool {
        self.first.is_empty()
    }

    pub fn batches(&self) -> usize {
        self.batches
    }

    pub fn first(&self) -> &[f64] {
        &self.first
    }

    pub fn second(&self) -> &[f64] {
        &self.second
    }

    /// Fold one batch of gradients in. Returns the number of buffer entries covered.
    pub fn accumulate<B: AutodiffBackend, M: Module<B>>(
        &mut self,
        module: &M,
        grads: &GradientsParams,
    ) -> usize {
        let mut visitor = MomentVisitor::<B> {
            moments: self,
            grads,
            offset: 0,
            phantom: PhantomData,
        };
        module.visit(&mut visitor);
        let covered = visitor.offset;
        self.batches += 1;
        covered
    }

    /// Divide both buffers by the batch count and summarise.
    ///
    /// # Panics
    ///
    /// Panics if no batch was accumulated.
    pub fn finalize(&mut self) -> MomentReport {
        assert!(
            self.batches > 0,
            "MOMENT ERROR: cannot finalize gradient moments without any batch"
        );
        let n = self.batches as f64;
        for (first, second) in self.first.iter_mut().zip(self.second.iter_mut()) {
            *first /= n;
            *second /= n;
        }

        let srm_g = self.second.iter().sum::<f64>();
        let mean_g_norm = self.first.iter().map(|f| f * f).sum::<f64>().sqrt();
        let var_g = self
            .second
            .iter()
            .zip(&self.first)
            .map(|(s, f)| s - f * f)
            .sum::<f64>();
        let uncertainty = if self.first.is_empty() {
            0.0
        } else {
            self.first
                .iter()
                .zip(&self.second)
                .map(|(f, s)| f.abs() / (s.sqrt() + 1e-6))
                .sum::<f64>()
                / self.first.len() as f64
        };

        MomentReport {
            srm_g,
            mean_g_norm,
            var_g,
            uncertainty,
            batches: self.batches,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::Autodiff;
    use burn::nn::{Linear, LinearConfig};
    use burn::tensor::TensorData;
    use burn_ndarray::NdArray;

    type TestBackend = Autodiff<NdArray<f32>>;

    #[derive(Module, Debug)]
    struct TwoLayer<B: Backend> {
        body: Linear<B>,
        head: Linear<B>,
    }

    fn model(device: &<TestBackend as Backend>::Device) -> TwoLayer<TestBackend> {
        TwoLayer {
            body: LinearConfig::new(3, 2).init(device),
            head: LinearConfig::new(2, 2).init(device),
        }
    }

    fn gradients(model: &TwoLayer<TestBackend>, scale: f32) -> GradientsParams {
        let device = Default::default();
        let x = Tensor::<TestBackend, 2>::from_data(
            TensorData::new(vec![1.0f32, -2.0, 0.5, 0.3, 0.1, -0.7], [2, 3]),
            &device,
        );
        let out = model.head.forward(model.body.forward(x));
        let loss = out.powf_scalar(2.0).sum().mul_scalar(scale);
        GradientsParams::from_grads(loss.backward(), model)
    }

    fn flat(model: &TwoLayer<TestBackend>, grads: &GradientsParams) -> Vec<f32> {
        let mut out = Vec::new();
        for id in [model.body.weight.id, model.head.weight.id] {
            if let Some(g) = grads.get::<NdArray<f32>, 2>(id) {
                out.extend(g.to_data().iter::<f32>());
            }
        }
        for bias in [&model.body.bias, &model.head.bias].into_iter().flatten() {
            if let Some(g) = grads.get::<NdArray<f32>, 1>(bias.id) {
                out.extend(g.to_data().iter::<f32>());
            }
        }
        out
    }

    #[test]
    fn test_clip_disabled_is_bit_identical() {
        let device = Default::default();
        let model = model(&device);
        let grads = gradients(&model, 10.0);
        let before = flat(&model, &grads);

        for threshold in [0.0, -1.0] {
            let (clipped, norm) = clip_grad_norm(&model, gradients(&model, 10.0), threshold);
            assert!(norm > 0.0);
            let after = flat(&model, &clipped);
            assert_eq!(before.len(), after.len());
            for (b, a) in before.iter().zip(&after) {
                assert_eq!(b.to_bits(), a.to_bits());
            }
        }
    }

    #[test]
    fn test_clip_rescales_to_threshold() {
        let device = Default::default();
        let model = model(&device);
        let grads = gradients(&model, 100.0);
        let norm = grad_norm(&model, &grads);
        assert!(norm > 0.5, "fixture gradient too small: {}", norm);

        let (clipped, before) = clip_grad_norm(&model, grads, 0.5);
        assert!((before - norm).abs() < 1e-9);
        assert!((grad_norm(&model, &clipped) - 0.5).abs() < 1e-4);
    }

    #[test]
    fn test_accumulate_sums_gradients() {
        let device = Default::default();
        let model = model(&device);
        let single = flat(&model, &gradients(&model, 1.0));

        let total = accumulate_gradients(&model, None, gradients(&model, 1.0));
        let total = accumulate_gradients(&model, Some(total), gradients(&model, 1.0));

        for (s, t) in single.iter().zip(flat(&model, &total)) {
            assert!((2.0 * s - t).abs() < 1e-5);
        }
    }

    #[test]
    fn test_svrg_zero_drift_is_identity() {
        let device = Default::default();
        let model = model(&device);
        let local = gradients(&model, 1.0);
        let raw = flat(&model, &local);
        // Global gradient at the batch equals the averaged global gradient.
        let global = gradients(&model, 3.0);
        let average = gradients(&model, 3.0);

        let corrected = svrg_correct(&model, local, &global, &average);

        for (r, c) in raw.iter().zip(flat(&model, &corrected)) {
            assert_eq!(r.to_bits(), c.to_bits());
        }
    }

    #[test]
    fn test_svrg_applies_drift() {
        let device = Default::default();
        let model = model(&device);
        let raw = flat(&model, &gradients(&model, 1.0));

        let corrected = svrg_correct(
            &model,
            gradients(&model, 1.0),
            &gradients(&model, 2.0),
            &gradients(&model, 3.0),
        );

        // g + (3g - 2g) = 2g
        for (r, c) in raw.iter().zip(flat(&model, &corrected)) {
            assert!((2.0 * r - c).abs() < 1e-5);
        }
    }

    #[test]
    #[should_panic(expected = "LAYOUT ERROR")]
    fn test_layout_mismatch_panics() {
        let device = Default::default();
        let a = model(&device);
        let b = model(&device);
        assert_same_layout(
            &ParamLayout::of::<TestBackend, _>(&a),
            &ParamLayout::of::<TestBackend, _>(&b),
        );
    }

    #[test]
    fn test_cloned_snapshot_has_same_layout() {
        let device = Default::default();
        let local = model(&device);
        let global = local.clone();
        assert_same_layout(
            &ParamLayout::of::<TestBackend, _>(&local),
            &ParamLayout::of::<TestBackend, _>(&global),
        );
    }

    #[test]
    fn test_moments_skip_excluded_head() {
        let device = Default::default();
        let model = model(&device);
        let mut head_ids = vec![model.head.weight.id];
        head_ids.extend(model.head.bias.as_ref().map(|b| b.id));

        let mut moments = GradientMoments::new::<TestBackend, _>(&model, head_ids);
        // body: 3*2 + 2, head: 2*2 + 2
        assert_eq!(moments.len(), 14);

        let covered = moments.accumulate(&model, &gradients(&model, 1.0));
        moments.accumulate(&model, &gradients(&model, 1.0));
        assert_eq!(covered, 8);
        assert!(moments.first()[8..].iter().all(|v| *v == 0.0));
        assert!(moments.first()[..8].iter().any(|v| *v != 0.0));

        let report = moments.finalize();
        assert_eq!(report.batches, 2);
        // Identical batches: zero variance, second moment equals first squared.
        assert!(report.var_g.abs() < 1e-6);
        assert!((report.srm_g - report.mean_g_norm.powi(2)).abs() < 1e-6);
    }
}
