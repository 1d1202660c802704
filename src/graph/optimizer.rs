use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use super::{GraphError, Parameter, Tensor};
use crate::config::RadamConfig;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RadamSlots {
    pub m: Vec<f64>,
    pub v: Vec<f64>,
    pub average: Vec<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RadamSnapshot {
    pub global_step: u64,
    pub slots: BTreeMap<String, RadamSlots>,
}

/// Adam with gamma-mixed momentum, global-norm clipping, exponential
/// learning-rate decay, and an optional Polyak average of every parameter.
#[derive(Debug)]
pub struct Radam {
    config: RadamConfig,
    global_step: u64,
    state: HashMap<usize, RadamSlots>,
}

impl Radam {
    pub fn new(config: RadamConfig) -> Self {
        Self {
            config,
            global_step: 0,
            state: HashMap::new(),
        }
    }

    pub fn global_step(&self) -> u64 {
        self.global_step
    }

    pub fn learning_rate(&self) -> f64 {
        let decay_steps = self.config.decay_steps.max(1.0);
        self.config.learning_rate
            * self
                .config
                .decay
                .powf(self.global_step as f64 / decay_steps)
    }

    /// Applies one update from the gradients currently stored on `params`
    /// and returns the global gradient norm before clipping.
    pub fn step(&mut self, params: &[Parameter]) -> f64 {
        let norm = params
            .iter()
            .map(|p| p.tensor.grad().iter().map(|g| g * g).sum::<f64>())
            .sum::<f64>()
            .sqrt();
        let clip_scale = if self.config.clip > 0.0 && norm > self.config.clip {
            self.config.clip / norm
        } else {
            1.0
        };

        let learning_rate = self.learning_rate();
        self.global_step += 1;
        let t = self.global_step as f64;
        let RadamConfig {
            mu,
            nu,
            gamma,
            epsilon,
            chi,
            ..
        } = self.config;

        for parameter in params {
            let tensor = &parameter.tensor;
            let len = tensor.rows() * tensor.cols();
            let slots = self.state.entry(tensor.id()).or_insert_with(|| RadamSlots {
                m: vec![0.0; len],
                v: vec![0.0; len],
                average: vec![0.0; len],
            });

            tensor.with_data_and_grad(|data, grad| {
                for idx in 0..len {
                    let g = grad[idx] * clip_scale;
                    let m_bar = if mu > 0.0 {
                        slots.m[idx] = mu * slots.m[idx] + (1.0 - mu) * g;
                        (1.0 - gamma) * slots.m[idx] / (1.0 - mu.powf(t)) + gamma * g
                    } else {
                        g
                    };
                    let v_bar = if nu > 0.0 {
                        slots.v[idx] = nu * slots.v[idx] + (1.0 - nu) * g * g;
                        slots.v[idx] / (1.0 - nu.powf(t))
                    } else {
                        1.0
                    };
                    data[idx] -= learning_rate * m_bar / (v_bar + epsilon).sqrt();
                    if chi > 0.0 {
                        slots.average[idx] = chi * slots.average[idx] + (1.0 - chi) * data[idx];
                    }
                }
            });
        }
        norm
    }

    /// Bias-corrected Polyak average of `tensor`, if averaging is enabled and
    /// the tensor has been updated at least once.
    pub fn moving_value(&self, tensor: &Tensor) -> Option<Vec<f64>> {
        if self.config.chi <= 0.0 || self.global_step == 0 {
            return None;
        }
        let slots = self.state.get(&tensor.id())?;
        let correction = 1.0 - self.config.chi.powf(self.global_step as f64);
        Some(slots.average.iter().map(|a| a / correction).collect())
    }

    /// Swaps the moving averages into `params` until the guard is dropped.
    pub fn swap_in_moving(&self, params: &[Parameter]) -> MovingGuard {
        let mut saved = Vec::with_capacity(params.len());
        for parameter in params {
            let Some(moving) = self.moving_value(&parameter.tensor) else {
                continue;
            };
            let current = parameter.tensor.data();
            parameter
                .tensor
                .with_data_mut(|data| data.copy_from_slice(&moving));
            saved.push((parameter.tensor.clone(), current));
        }
        MovingGuard { saved }
    }

    pub fn snapshot(&self, params: &[Parameter]) -> RadamSnapshot {
        let slots = params
            .iter()
            .filter_map(|p| {
                self.state
                    .get(&p.tensor.id())
                    .map(|slots| (p.name.clone(), slots.clone()))
            })
            .collect();
        RadamSnapshot {
            global_step: self.global_step,
            slots,
        }
    }

    pub fn restore(
        &mut self,
        params: &[Parameter],
        snapshot: &RadamSnapshot,
    ) -> Result<(), GraphError> {
        let by_name: HashMap<&str, &Parameter> =
            params.iter().map(|p| (p.name.as_str(), p)).collect();
        self.state.clear();
        for (name, slots) in &snapshot.slots {
            let parameter = by_name
                .get(name.as_str())
                .ok_or_else(|| GraphError::UnknownParameter(name.clone()))?;
            let (rows, cols) = parameter.tensor.shape();
            for buffer in [&slots.m, &slots.v, &slots.average] {
                if buffer.len() != rows * cols {
                    return Err(GraphError::Shape {
                        rows,
                        cols,
                        len: buffer.len(),
                    });
                }
            }
            self.state.insert(parameter.tensor.id(), slots.clone());
        }
        self.global_step = snapshot.global_step;
        Ok(())
    }
}

/// Restores the live parameter values on drop.
#[derive(Debug)]
pub struct MovingGuard {
    saved: Vec<(Tensor, Vec<f64>)>,
}

impl Drop for MovingGuard {
    fn drop(&mut self) {
        for (tensor, data) in self.saved.drain(..) {
            tensor.with_data_mut(|live| live.copy_from_slice(&data));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Radam;
    use crate::config::RadamConfig;
    use crate::graph::{Parameter, Tensor};

    fn plain_adam() -> RadamConfig {
        RadamConfig {
            learning_rate: 0.1,
            decay: 1.0,
            decay_steps: 1.0,
            mu: 0.9,
            nu: 0.999,
            gamma: 0.0,
            epsilon: 1e-16,
            chi: 0.0,
            clip: 0.0,
        }
    }

    fn half_loss_step(optimizer: &mut Radam, params: &[Parameter]) {
        let half = Tensor::scalar(0.5);
        params[0].tensor.zero_grad();
        params[0].tensor.mul(&half).sum().backward();
        optimizer.step(params);
    }

    #[test]
    fn updates_match_adam_for_repeated_gradient() {
        let params = vec![Parameter::new("x", Tensor::scalar(1.0))];
        let mut optimizer = Radam::new(plain_adam());

        half_loss_step(&mut optimizer, &params);
        assert!((params[0].tensor.item() - 0.9).abs() < 1e-8);

        half_loss_step(&mut optimizer, &params);
        assert!((params[0].tensor.item() - 0.8).abs() < 1e-8);
        assert_eq!(optimizer.global_step(), 2);
    }

    #[test]
    fn learning_rate_decays_with_global_step() {
        let mut config = plain_adam();
        config.decay = 0.5;
        config.decay_steps = 2.0;
        let params = vec![Parameter::new("x", Tensor::scalar(1.0))];
        let mut optimizer = Radam::new(config);
        assert!((optimizer.learning_rate() - 0.1).abs() < 1e-12);
        half_loss_step(&mut optimizer, &params);
        half_loss_step(&mut optimizer, &params);
        assert!((optimizer.learning_rate() - 0.05).abs() < 1e-12);
    }

    #[test]
    fn clipping_bounds_the_effective_gradient() {
        let mut config = plain_adam();
        config.mu = 0.0;
        config.nu = 0.0;
        config.clip = 1.0;
        config.learning_rate = 1.0;
        let params = vec![Parameter::new("x", Tensor::scalar(0.0))];
        let mut optimizer = Radam::new(config);

        params[0].tensor.zero_grad();
        params[0].tensor.scale(10.0).sum().backward();
        let norm = optimizer.step(&params);

        assert!((norm - 10.0).abs() < 1e-12);
        // plain SGD on the clipped gradient: 0 - 1.0 * 1.0 / sqrt(1 + eps)
        assert!((params[0].tensor.item() + 1.0).abs() < 1e-6);
    }

    #[test]
    fn moving_params_lag_behind_and_restore_on_drop() {
        let mut config = plain_adam();
        config.chi = 0.9;
        let params = vec![Parameter::new("x", Tensor::scalar(1.0))];
        let mut optimizer = Radam::new(config);
        assert!(optimizer.moving_value(&params[0].tensor).is_none());

        for _ in 0..5 {
            half_loss_step(&mut optimizer, &params);
        }
        let live = params[0].tensor.item();
        let moving = optimizer.moving_value(&params[0].tensor).expect("averaging on")[0];
        assert!(moving > live, "average {moving} should trail live value {live}");

        {
            let _guard = optimizer.swap_in_moving(&params);
            assert!((params[0].tensor.item() - moving).abs() < 1e-12);
        }
        assert!((params[0].tensor.item() - live).abs() < 1e-12);
    }

    #[test]
    fn snapshot_restores_into_fresh_optimizer() {
        let mut config = plain_adam();
        config.chi = 0.5;
        let params = vec![Parameter::new("x", Tensor::scalar(1.0))];
        let mut optimizer = Radam::new(config);
        half_loss_step(&mut optimizer, &params);
        let snapshot = optimizer.snapshot(&params);

        let mut restored = Radam::new(config);
        restored.restore(&params, &snapshot).expect("known params");
        assert_eq!(restored.global_step(), 1);
        assert_eq!(
            restored.moving_value(&params[0].tensor),
            optimizer.moving_value(&params[0].tensor)
        );

        let stranger = vec![Parameter::new("y", Tensor::scalar(0.0))];
        assert!(Radam::new(config).restore(&stranger, &snapshot).is_err());
    }
}
