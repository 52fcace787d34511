#![cfg_attr(not(feature = "std"), no_std)]
//! An implementation of the gradient-descent (Madgwick) IMU orientation filter in pure Rust.
//!
//! The filter fuses gyroscope and accelerometer samples into an orientation quaternion. For every sample the
//! gyroscope is integrated to predict the change of orientation, one normalized gradient-descent step pulls the
//! predicted gravity direction towards the measured one, the two are blended by the gain β and the result is
//! renormalized.
//!
//! The main entry point for this crate is [`Madgwick`]; look there to get started.
//!
//! This crate optionally supports `no_std`; the `libm` or `micromath` crate feature is required in `no_std`
//! environments.

#[cfg(feature = "f32")]
/// Typedef for the floating-point data type used for all operations.
///
/// By default, all floating-point calculations are performed using `f64`. Enable the `f32` crate feature to
/// change this type to `f32`.
pub type Float = f32;
#[cfg(not(feature = "f32"))]
/// Typedef for the floating-point data type used for all operations.
///
/// By default, all floating-point calculations are performed using `f64`. Enable the `f32` crate feature to
/// change this type to `f32`.
pub type Float = f64;

#[cfg(feature = "std")]
type Math<T> = T;
#[cfg(all(feature = "libm", not(feature = "std")))]
type Math<T> = libm::Libm<T>;
#[cfg(all(feature = "micromath", not(any(feature = "std", feature = "libm"))))]
type Math<T> = micro::MicroMath<T>;

#[cfg(not(any(feature = "std", feature = "libm", feature = "micromath")))]
compile_error!("one of the `std`, `libm` or `micromath` features must be enabled");

#[cfg(feature = "f32")]
use core::f32::consts as fc;
#[cfg(not(feature = "f32"))]
use core::f64::consts as fc;
use core::{
    fmt,
    ops::{Add, AddAssign, Div, Mul, MulAssign, Neg, Sub, SubAssign},
};

#[cfg(all(feature = "micromath", not(any(feature = "std", feature = "libm"))))]
mod micro {
    use core::marker::PhantomData;
    use micromath::F32Ext;

    /// Routes the float functions used by the filter to `micromath` approximations.
    pub struct MicroMath<T>(PhantomData<T>);

    impl MicroMath<f32> {
        pub fn sqrt(x: f32) -> f32 {
            F32Ext::sqrt(x)
        }

        pub fn sin(x: f32) -> f32 {
            F32Ext::sin(x)
        }

        pub fn asin(x: f32) -> f32 {
            F32Ext::asin(x)
        }

        pub fn acos(x: f32) -> f32 {
            F32Ext::acos(x)
        }

        pub fn atan2(y: f32, x: f32) -> f32 {
            F32Ext::atan2(y, x)
        }
    }
}

/// A quaternion `(w, x, y, z)` with the real part first.
///
/// The default value is the identity, i.e. no rotation.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub struct Quaternion(pub Float, pub Float, pub Float, pub Float);

impl Default for Quaternion {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Mul for Quaternion {
    type Output = Quaternion;

    /// Hamilton product.
    fn mul(self, rhs: Self) -> Self::Output {
        let w = self.0 * rhs.0 - self.1 * rhs.1 - self.2 * rhs.2 - self.3 * rhs.3;
        let x = self.0 * rhs.1 + self.1 * rhs.0 + self.2 * rhs.3 - self.3 * rhs.2;
        let y = self.0 * rhs.2 - self.1 * rhs.3 + self.2 * rhs.0 + self.3 * rhs.1;
        let z = self.0 * rhs.3 + self.1 * rhs.2 - self.2 * rhs.1 + self.3 * rhs.0;
        Self(w, x, y, z)
    }
}

impl MulAssign for Quaternion {
    fn mul_assign(&mut self, rhs: Self) {
        *self = *self * rhs;
    }
}

impl Mul<Float> for Quaternion {
    type Output = Quaternion;

    fn mul(self, rhs: Float) -> Self::Output {
        Self(self.0 * rhs, self.1 * rhs, self.2 * rhs, self.3 * rhs)
    }
}

impl Mul<Quaternion> for Float {
    type Output = Quaternion;

    fn mul(self, rhs: Quaternion) -> Self::Output {
        rhs * self
    }
}

impl Div<Float> for Quaternion {
    type Output = Quaternion;

    fn div(self, rhs: Float) -> Self::Output {
        Self(self.0 / rhs, self.1 / rhs, self.2 / rhs, self.3 / rhs)
    }
}

impl Add for Quaternion {
    type Output = Quaternion;

    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0 + rhs.0, self.1 + rhs.1, self.2 + rhs.2, self.3 + rhs.3)
    }
}

impl AddAssign for Quaternion {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Sub for Quaternion {
    type Output = Quaternion;

    fn sub(self, rhs: Self) -> Self::Output {
        Self(self.0 - rhs.0, self.1 - rhs.1, self.2 - rhs.2, self.3 - rhs.3)
    }
}

impl SubAssign for Quaternion {
    fn sub_assign(&mut self, rhs: Self) {
        *self = *self - rhs;
    }
}

impl Neg for Quaternion {
    type Output = Quaternion;

    fn neg(self) -> Self::Output {
        Self(-self.0, -self.1, -self.2, -self.3)
    }
}

impl From<[Float; 4]> for Quaternion {
    fn from(value: [Float; 4]) -> Self {
        Self(value[0], value[1], value[2], value[3])
    }
}

impl From<Quaternion> for [Float; 4] {
    fn from(value: Quaternion) -> Self {
        [value.0, value.1, value.2, value.3]
    }
}

impl From<Matrix<1, 4>> for Quaternion {
    fn from(value: Matrix<1, 4>) -> Self {
        Self(value.0[0][0], value.0[1][0], value.0[2][0], value.0[3][0])
    }
}

impl Quaternion {
    /// The identity quaternion `(1, 0, 0, 0)`.
    pub const IDENTITY: Quaternion = Quaternion(1.0, 0.0, 0.0, 0.0);

    pub fn norm(&self) -> Float {
        Math::<Float>::sqrt(self.dot(self))
    }

    /// Normalizes in place. Leaves the quaternion untouched if its norm is (close to) zero or not finite.
    pub fn normalize(&mut self) {
        let n = self.norm();
        if !n.is_finite() || n < Float::EPSILON {
            return;
        }
        self.0 /= n;
        self.1 /= n;
        self.2 /= n;
        self.3 /= n;
    }

    /// Returns the versor of this quaternion, or `None` if the norm is (close to) zero or not finite.
    pub fn normalized(&self) -> Option<Quaternion> {
        let n = self.norm();
        if !n.is_finite() || n < Float::EPSILON {
            return None;
        }
        Some(*self / n)
    }

    pub fn conjugate(&self) -> Quaternion {
        Self(self.0, -self.1, -self.2, -self.3)
    }

    pub fn dot(&self, rhs: &Quaternion) -> Float {
        self.0 * rhs.0 + self.1 * rhs.1 + self.2 * rhs.2 + self.3 * rhs.3
    }

    /// Returns `conjugate / norm²`, or the identity for a zero quaternion.
    pub fn inverse(&self) -> Quaternion {
        let n2 = self.dot(self);
        if n2 == 0.0 {
            return Self::IDENTITY;
        }
        self.conjugate() / n2
    }

    pub fn is_finite(&self) -> bool {
        self.0.is_finite() && self.1.is_finite() && self.2.is_finite() && self.3.is_finite()
    }

    /// Rotates `v` by this (unit) quaternion, i.e. computes the vector part of $q \otimes v \otimes q^*$.
    pub fn rotate(&self, v: [Float; 3]) -> [Float; 3] {
        let x = (1.0 - 2.0 * self.2 * self.2 - 2.0 * self.3 * self.3) * v[0]
            + 2.0 * v[1] * (self.2 * self.1 - self.0 * self.3)
            + 2.0 * v[2] * (self.0 * self.2 + self.3 * self.1);
        let y = 2.0 * v[0] * (self.0 * self.3 + self.2 * self.1)
            + v[1] * (1.0 - 2.0 * self.1 * self.1 - 2.0 * self.3 * self.3)
            + 2.0 * v[2] * (self.2 * self.3 - self.1 * self.0);
        let z = 2.0 * v[0] * (self.3 * self.1 - self.0 * self.2)
            + 2.0 * v[1] * (self.0 * self.1 + self.3 * self.2)
            + v[2] * (1.0 - 2.0 * self.1 * self.1 - 2.0 * self.2 * self.2);
        [x, y, z]
    }

    /// Converts a unit quaternion to `[roll, pitch, yaw]` (in rad, ZYX convention).
    ///
    /// The pitch is clamped to ±π/2 so that rounding errors near gimbal lock do not produce NaN.
    pub fn to_euler_angles(&self) -> [Float; 3] {
        let Quaternion(w, x, y, z) = *self;
        let roll = Math::<Float>::atan2(2.0 * (w * x + y * z), 1.0 - 2.0 * (x * x + y * y));
        let pitch = Math::<Float>::asin((2.0 * (w * y - z * x)).clamp(-1.0, 1.0));
        let yaw = Math::<Float>::atan2(2.0 * (w * z + x * y), 1.0 - 2.0 * (y * y + z * z));
        [roll, pitch, yaw]
    }

    /// Converts a unit quaternion to a rotation axis and an angle in rad.
    ///
    /// For (nearly) zero rotations the axis is undefined and `[0, 0, 0]` is returned.
    pub fn to_axis_angle(&self) -> ([Float; 3], Float) {
        let angle = 2.0 * Math::<Float>::acos(self.0.clamp(-1.0, 1.0));
        let s = Math::<Float>::sin(angle / 2.0);
        if s < Float::EPSILON {
            return ([0.0; 3], angle);
        }
        ([self.1 / s, self.2 / s, self.3 / s], angle)
    }
}

/// A fixed-size matrix with `W` columns and `H` rows, stored row-major.
///
/// As this type was made solely for internal purposes, external usage seems ill-advised.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Matrix<const W: usize, const H: usize>(pub [[Float; W]; H]);

impl<const W: usize, const H: usize> Default for Matrix<W, H> {
    fn default() -> Self {
        Self([[0.0; W]; H])
    }
}

impl<const W: usize, const H: usize> From<[[Float; W]; H]> for Matrix<W, H> {
    fn from(value: [[Float; W]; H]) -> Self {
        Self(value)
    }
}

impl<const M: usize, const N: usize, const P: usize> Mul<Matrix<P, N>> for Matrix<N, M> {
    type Output = Matrix<P, M>;

    fn mul(self, rhs: Matrix<P, N>) -> Self::Output {
        let mut out: Matrix<P, M> = Default::default();
        for i in 0..M {
            for j in 0..P {
                let mut val = 0.0;
                for k in 0..N {
                    val += self.0[i][k] * rhs.0[k][j];
                }
                out.0[i][j] = val;
            }
        }
        out
    }
}

impl<const W: usize, const H: usize> Matrix<W, H> {
    pub fn transpose(self) -> Matrix<H, W> {
        let mut out: Matrix<H, W> = Default::default();
        for i in 0..W {
            for j in 0..H {
                out.0[i][j] = self.0[j][i];
            }
        }
        out
    }
}

/// Tuning parameters of the filter.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub struct Params {
    /// Filter gain β, the weight of the accelerometer correction against gyroscope integration.
    ///
    /// β represents all mean zero gyroscope measurement errors, expressed as the magnitude of a quaternion
    /// derivative. Use [`Params::from_gyro_error`] to derive it from the expected gyroscope error.
    ///
    /// Default value: β for a gyroscope error of 5 °/s (≈ 0.0756)
    pub beta: Float,
}

impl Default for Params {
    fn default() -> Self {
        Self::from_gyro_error(5.0 * (fc::PI / 180.0))
    }
}

impl Params {
    /// Derives the gain from the expected gyroscope measurement error (in rad/s) as
    /// $\beta = \sqrt{3/4}\,\tilde\omega_\beta$.
    pub fn from_gyro_error(gyro_error: Float) -> Self {
        Self {
            beta: Math::<Float>::sqrt(3.0 / 4.0) * gyro_error,
        }
    }
}

/// Outcome of the accelerometer correction of the last update.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum Correction {
    /// The gradient-descent correction was blended into the gyroscope rate.
    Applied,
    /// The accelerometer sample had (close to) zero norm; only the gyroscope was integrated.
    DegenerateInput,
    /// The descent direction had (close to) zero norm; only the gyroscope was integrated.
    DegenerateGradient,
}

/// Mutable state of the filter.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub struct State {
    /// Estimated orientation, rotating the earth frame into the sensor frame.
    pub quat: Quaternion,

    /// Accelerometer residual $f$ of the last update (zero if the accelerometer sample was degenerate).
    pub last_acc_residual: [Float; 3],

    /// Outcome of the accelerometer correction of the last update, `None` before the first update.
    pub last_correction: Option<Correction>,
}

/// Errors reported by [`Madgwick`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum Error {
    /// The sample interval was not strictly positive and finite.
    InvalidSampleInterval,
    /// The gain was negative or not finite.
    InvalidGain,
    /// The integrated orientation had a zero or non-finite norm. The state was not updated.
    NumericDivergence,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidSampleInterval => f.write_str("sample interval must be positive and finite"),
            Error::InvalidGain => f.write_str("filter gain must be non-negative and finite"),
            Error::NumericDivergence => f.write_str("orientation diverged to a zero or non-finite quaternion"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

#[inline(always)]
fn square(t: Float) -> Float {
    t * t
}

/// Gradient-descent orientation filter for 6D (gyroscope + accelerometer) IMU data.
///
/// This implements the IMU variant of the filter described in
/// > S. O. H. Madgwick. "An efficient orientation filter for inertial and inertial/magnetic sensor arrays."
/// > Internal report, University of Bristol, 2010.
///
/// Each instance owns its orientation, gain and sample interval. Instances are independent; updates on one
/// instance must be serialized by the caller (`update` takes `&mut self`).
///
/// To use this implementation,
/// 1. create an instance with the sampling time and, optionally, parameters
/// 2. for every sample, call [`update()`](Self::update()) with the gyroscope and accelerometer readings
/// 3. use the returned quaternion or access it later with [`quat()`](Self::quat()).
pub struct Madgwick {
    params: Params,
    sample_interval: Float,
    state: State,
}

impl Madgwick {
    /// Creates a new filter with the orientation set to the identity.
    ///
    /// ```rust
    /// # use madgwick_imu::Madgwick;
    /// let filter = Madgwick::new(0.01, None); // 0.01 s sampling time, i.e. 100 Hz
    /// ```
    ///
    /// # Panics
    ///
    /// Panics if `sample_interval` is not strictly positive and finite, or if the gain in `params` is negative
    /// or not finite.
    pub fn new(sample_interval: Float, params: Option<Params>) -> Self {
        let params = params.unwrap_or_default();
        assert!(sample_interval.is_finite() && sample_interval > 0.0);
        assert!(params.beta.is_finite() && params.beta >= 0.0);
        Self {
            params,
            sample_interval,
            state: Default::default(),
        }
    }

    /// Performs the filter update step for one sample and returns the new orientation.
    ///
    /// `gyr` is the angular rate in rad/s. `acc` may be in any unit, only its direction is used. An all-zero
    /// `acc` skips the correction and integrates the gyroscope only.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NumericDivergence`] if the integrated orientation is zero or not finite (e.g. due to
    /// non-finite input). The state is left unchanged in that case.
    pub fn update(&mut self, gyr: [Float; 3], acc: [Float; 3]) -> Result<Quaternion, Error> {
        let quat = self.state.quat;

        // rate of change of the orientation measured by the gyroscope
        let q_dot_omega = Self::gyro_rate(quat, gyr);

        let mut acc_dir = acc;
        let (q_dot, residual, correction) = if Self::normalize(&mut acc_dir) {
            let f = Self::accel_residual(quat, acc_dir);
            let jacobian = Self::accel_jacobian(quat);
            match Self::gradient_step(f, jacobian) {
                Some(step) => (q_dot_omega - self.params.beta * step, f, Correction::Applied),
                None => (q_dot_omega, f, Correction::DegenerateGradient),
            }
        } else {
            (q_dot_omega, [0.0; 3], Correction::DegenerateInput)
        };

        if correction != Correction::Applied {
            log::trace!("skipping accelerometer correction: {:?}", correction);
        }

        // first-order integration, the result must be a versor again
        let new_quat = (quat + q_dot * self.sample_interval)
            .normalized()
            .ok_or_else(|| {
                log::warn!("orientation diverged, rejecting sample (gyr={:?}, acc={:?})", gyr, acc);
                Error::NumericDivergence
            })?;

        self.state = State {
            quat: new_quat,
            last_acc_residual: residual,
            last_correction: Some(correction),
        };
        Ok(new_quat)
    }

    /// Computes the residual between the gravity direction predicted by `quat` and the normalized
    /// accelerometer reading `acc`.
    ///
    /// ```text
    /// f1 = 2(q2 q4 - q1 q3)   - ax
    /// f2 = 2(q1 q2 + q3 q4)   - ay
    /// f3 = 2(0.5 - q2² - q3²) - az
    /// ```
    pub fn accel_residual(quat: Quaternion, acc: [Float; 3]) -> [Float; 3] {
        let Quaternion(q1, q2, q3, q4) = quat;
        [
            2.0 * (q2 * q4 - q1 * q3) - acc[0],
            2.0 * (q1 * q2 + q3 * q4) - acc[1],
            2.0 * (0.5 - q2 * q2 - q3 * q3) - acc[2],
        ]
    }

    /// Computes the 3x4 Jacobian of [`accel_residual()`](Self::accel_residual()) with respect to the quaternion.
    pub fn accel_jacobian(quat: Quaternion) -> Matrix<4, 3> {
        let Quaternion(q1, q2, q3, q4) = quat;
        [
            [-2.0 * q3, 2.0 * q4, -2.0 * q1, 2.0 * q2],
            [2.0 * q2, 2.0 * q1, 2.0 * q4, 2.0 * q3],
            [0.0, -4.0 * q2, -4.0 * q3, 0.0],
        ]
        .into()
    }

    /// Computes the normalized descent direction $J^T f$.
    ///
    /// Returns `None` if the direction has (close to) zero norm.
    pub fn gradient_step(residual: [Float; 3], jacobian: Matrix<4, 3>) -> Option<Quaternion> {
        let f: Matrix<1, 3> = [[residual[0]], [residual[1]], [residual[2]]].into();
        let step: Quaternion = (jacobian.transpose() * f).into();
        let n = step.norm();
        if n < Float::EPSILON {
            return None;
        }
        Some(step / n)
    }

    /// Computes the orientation derivative $\frac{1}{2} q \otimes (0, \omega)$ caused by the angular rate `gyr`.
    pub fn gyro_rate(quat: Quaternion, gyr: [Float; 3]) -> Quaternion {
        let half = quat * 0.5;
        Quaternion(
            -half.1 * gyr[0] - half.2 * gyr[1] - half.3 * gyr[2],
            half.0 * gyr[0] + half.2 * gyr[2] - half.3 * gyr[1],
            half.0 * gyr[1] - half.1 * gyr[2] + half.3 * gyr[0],
            half.0 * gyr[2] + half.1 * gyr[1] - half.2 * gyr[0],
        )
    }

    /// Returns the current orientation estimate.
    pub fn quat(&self) -> Quaternion {
        self.state.quat
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    /// Returns the sampling time in seconds.
    pub fn sample_interval(&self) -> Float {
        self.sample_interval
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    /// Returns a mutable reference to the state, e.g. to restore a checkpoint or set an initial orientation.
    ///
    /// The orientation must be kept a unit quaternion.
    pub fn state_mut(&mut self) -> &mut State {
        &mut self.state
    }

    /// Resets the orientation to the identity and clears the debugging fields.
    pub fn reset_state(&mut self) {
        self.state = Default::default();
    }

    /// Sets the sampling time. Non-positive or non-finite values are rejected and the old value is kept.
    pub fn set_sample_interval(&mut self, sample_interval: Float) -> Result<(), Error> {
        if !sample_interval.is_finite() || sample_interval <= 0.0 {
            return Err(Error::InvalidSampleInterval);
        }
        log::debug!("sample interval set to {} s", sample_interval);
        self.sample_interval = sample_interval;
        Ok(())
    }

    /// Sets the gain β. Negative or non-finite values are rejected and the old value is kept.
    pub fn set_beta(&mut self, beta: Float) -> Result<(), Error> {
        if !beta.is_finite() || beta < 0.0 {
            return Err(Error::InvalidGain);
        }
        log::debug!("beta set to {}", beta);
        self.params.beta = beta;
        Ok(())
    }

    /// Sets the gain β from the expected gyroscope measurement error in rad/s.
    ///
    /// See [`Params::from_gyro_error`].
    pub fn set_gyro_error_gain(&mut self, gyro_error: Float) -> Result<(), Error> {
        self.set_beta(Params::from_gyro_error(gyro_error).beta)
    }

    /// Euclidean norm, scaled by the largest component so that large finite vectors do not overflow.
    fn norm<const N: usize>(vec: &[Float; N]) -> Float {
        let mut scale: Float = 0.0;
        for &i in vec {
            let a = if i < 0.0 { -i } else { i };
            if a > scale {
                scale = a;
            }
        }

        let mut s = 0.0;
        if scale > 0.0 && scale.is_finite() {
            for i in vec {
                s += square(i / scale);
            }
            return scale * Math::<Float>::sqrt(s);
        }

        // zero, or NaN/inf components that must show up in the result
        for i in vec {
            s += i * i;
        }
        Math::<Float>::sqrt(s)
    }

    /// Normalizes `vec` in place. Returns `false` and leaves it untouched if its norm is (close to) zero.
    fn normalize<const N: usize>(vec: &mut [Float; N]) -> bool {
        let n = Self::norm(vec);
        if n < Float::EPSILON {
            return false;
        }
        for i in vec.iter_mut() {
            *i /= n;
        }
        true
    }
}
