//! Cubic B-spline coefficients of a 1-D signal with mirror-symmetric
//! boundaries, optionally smoothed.
//!
//! With `lambda > 0` the signal is run through the causal and anti-causal
//! second-order recursions of the smoothing-spline filter (Unser et al.),
//! initialised from the closed-form impulse responses. `lambda == 0` gives
//! the interpolating spline.

/// Pole radius and angle of the smoothing filter for `lambda`.
fn smoothing_pole(lambda: f64) -> (f64, f64) {
    let root = (3.0 + 144.0 * lambda).sqrt();
    let xi = 1.0 - 96.0 * lambda + 24.0 * lambda * root;
    let omega = (144.0 * lambda - 1.0).sqrt().atan2(xi.sqrt());
    let rho = (24.0 * lambda - 1.0 - xi.sqrt()) / (24.0 * lambda)
        * ((48.0 * lambda + 24.0 * lambda * root) / xi).sqrt();
    (rho, omega)
}

struct Filter {
    rho: f64,
    omega: f64,
    cs: f64,
}

impl Filter {
    fn new(lambda: f64) -> Self {
        let (rho, omega) = smoothing_pole(lambda);
        let cs = 1.0 - 2.0 * rho * omega.cos() + rho * rho;
        Self { rho, omega, cs }
    }

    /// Causal impulse response.
    fn hc(&self, k: i64) -> f64 {
        if k < 0 {
            return 0.0;
        }
        let k = k as f64;
        self.cs / self.omega.sin() * self.rho.powf(k) * (self.omega * (k + 1.0)).sin()
    }

    /// Symmetric impulse response of the full filter.
    fn hs(&self, k: i64) -> f64 {
        let (rho, omega, cs) = (self.rho, self.omega, self.cs);
        let rho2 = rho * rho;
        let c0 = cs * cs * (1.0 + rho2) / (1.0 - rho2)
            / (1.0 - 2.0 * rho2 * (2.0 * omega).cos() + rho2 * rho2);
        let gamma = (1.0 - rho2) / (1.0 + rho2) / omega.tan();
        let ak = k.unsigned_abs() as f64;
        c0 * rho.powf(ak) * ((omega * ak).cos() + gamma * (omega * ak).sin())
    }
}

/// Smoothing-spline coefficients of `signal`.
///
/// Signals of fewer than two samples are returned unchanged.
pub fn smooth_coefficients(signal: &[f64], lambda: f64) -> Vec<f64> {
    let n = signal.len();
    if n < 2 {
        return signal.to_vec();
    }
    if lambda <= 0.0 {
        return interpolating_coefficients(signal);
    }

    let f = Filter::new(lambda);
    let a1 = 2.0 * f.rho * f.omega.cos();
    let a2 = f.rho * f.rho;

    let mut causal = vec![0.0; n];
    causal[0] = f.hc(0) * signal[0]
        + signal
            .iter()
            .enumerate()
            .map(|(k, s)| f.hc(k as i64 + 1) * s)
            .sum::<f64>();
    causal[1] = f.hc(0) * signal[0]
        + f.hc(1) * signal[1]
        + signal
            .iter()
            .enumerate()
            .map(|(k, s)| f.hc(k as i64 + 2) * s)
            .sum::<f64>();
    for i in 2..n {
        causal[i] = f.cs * signal[i] + a1 * causal[i - 1] - a2 * causal[i - 2];
    }

    let mut out = vec![0.0; n];
    out[n - 1] = signal
        .iter()
        .rev()
        .enumerate()
        .map(|(k, s)| (f.hs(k as i64) + f.hs(k as i64 + 1)) * s)
        .sum();
    out[n - 2] = signal
        .iter()
        .rev()
        .enumerate()
        .map(|(k, s)| (f.hs(k as i64 - 1) + f.hs(k as i64 + 2)) * s)
        .sum();
    for i in (0..n - 2).rev() {
        out[i] = f.cs * causal[i] + a1 * out[i + 1] - a2 * out[i + 2];
    }
    out
}

/// Interpolating cubic B-spline coefficients (single pole `√3 − 2`).
fn interpolating_coefficients(signal: &[f64]) -> Vec<f64> {
    let n = signal.len();
    let z = 3f64.sqrt() - 2.0;

    let mut power = 1.0;
    let mut seed = 0.0;
    for s in signal {
        seed += power * s;
        power *= z;
    }

    let mut causal = vec![0.0; n];
    causal[0] = signal[0] + z * seed;
    for i in 1..n {
        causal[i] = signal[i] + z * causal[i - 1];
    }

    let mut out = vec![0.0; n];
    out[n - 1] = z / (z - 1.0) * causal[n - 1];
    for i in (0..n - 1).rev() {
        out[i] = z * (out[i + 1] - causal[i]);
    }
    out.iter_mut().for_each(|v| *v *= 6.0);
    out
}
