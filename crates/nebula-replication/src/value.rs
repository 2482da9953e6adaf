//! Replicated value kinds and their per-kind interpolation rules.
//!
//! The set of kinds is closed: [`Value`] holds the data and [`ValueTemplate`]
//! names the kind and owns the comparison, extrapolation and blending rules,
//! each dispatched with a `match`.

use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Transform
// ---------------------------------------------------------------------------

/// Rigid transform: rotation followed by translation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    /// Translation applied after rotation.
    pub translation: Vec3,
    /// Unit rotation.
    pub rotation: Quat,
}

impl Transform {
    /// The identity transform.
    pub const IDENTITY: Self = Self {
        translation: Vec3::ZERO,
        rotation: Quat::IDENTITY,
    };

    /// Create a transform from translation and rotation.
    pub fn new(translation: Vec3, rotation: Quat) -> Self {
        Self {
            translation,
            rotation,
        }
    }

    /// Pure translation.
    pub fn from_translation(translation: Vec3) -> Self {
        Self::new(translation, Quat::IDENTITY)
    }

    /// Inverse transform.
    pub fn inverse(&self) -> Self {
        let rotation = self.rotation.conjugate();
        Self {
            translation: -(rotation * self.translation),
            rotation,
        }
    }

    /// Map a point from this frame into the parent frame.
    pub fn transform_point(&self, point: Vec3) -> Vec3 {
        self.rotation * point + self.translation
    }

    /// Rotate a direction into the parent frame.
    pub fn transform_vector(&self, vector: Vec3) -> Vec3 {
        self.rotation * vector
    }

    /// `self * other`: apply `other`, then `self`.
    pub fn mul_transform(&self, other: &Transform) -> Transform {
        Transform {
            translation: self.transform_point(other.translation),
            rotation: (self.rotation * other.rotation).normalize(),
        }
    }
}

impl Default for Transform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

// ---------------------------------------------------------------------------
// BodyState
// ---------------------------------------------------------------------------

/// Physical state of a rigid body.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BodyState {
    /// World position.
    pub position: Vec3,
    /// World orientation.
    pub orientation: Quat,
    /// Linear velocity in units per second.
    pub linear_velocity: Vec3,
    /// Angular velocity as a scaled axis, radians per second.
    pub angular_velocity: Vec3,
}

impl BodyState {
    /// Advance by `dt` seconds at constant linear and angular velocity.
    pub fn integrate(&self, dt: f32) -> Self {
        let spin = Quat::from_scaled_axis(self.angular_velocity * dt);
        Self {
            position: self.position + self.linear_velocity * dt,
            orientation: (spin * self.orientation).normalize(),
            ..*self
        }
    }

    /// Express this body in the parent frame of `by`.
    pub fn transformed(&self, by: &Transform) -> Self {
        Self {
            position: by.transform_point(self.position),
            orientation: (by.rotation * self.orientation).normalize(),
            linear_velocity: by.transform_vector(self.linear_velocity),
            angular_velocity: by.transform_vector(self.angular_velocity),
        }
    }
}

// ---------------------------------------------------------------------------
// Value
// ---------------------------------------------------------------------------

/// One replicated field value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// Last value wins; never interpolated.
    Bool(bool),
    /// Linear.
    Float(f32),
    /// Linear, component-wise.
    Vector(Vec3),
    /// Linear translation, spherical rotation.
    Transform(Transform),
    /// Constant-velocity integration.
    BodyState(BodyState),
}

impl Value {
    /// Kind of this value.
    pub fn template(&self) -> ValueTemplate {
        match self {
            Value::Bool(_) => ValueTemplate::Bool,
            Value::Float(_) => ValueTemplate::Float,
            Value::Vector(_) => ValueTemplate::Vector,
            Value::Transform(_) => ValueTemplate::Transform,
            Value::BodyState(_) => ValueTemplate::BodyState,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            Value::Bool(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f32> {
        match *self {
            Value::Float(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_vector(&self) -> Option<Vec3> {
        match *self {
            Value::Vector(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_transform(&self) -> Option<Transform> {
        match *self {
            Value::Transform(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_body_state(&self) -> Option<BodyState> {
        match *self {
            Value::BodyState(value) => Some(value),
            _ => None,
        }
    }

    /// Map a spatial value from a local frame into the parent frame of `by`.
    /// Vectors are treated as points.
    pub fn transformed(&self, by: &Transform) -> Value {
        match self {
            Value::Bool(_) | Value::Float(_) => *self,
            Value::Vector(point) => Value::Vector(by.transform_point(*point)),
            Value::Transform(transform) => Value::Transform(by.mul_transform(transform)),
            Value::BodyState(body) => Value::BodyState(body.transformed(by)),
        }
    }
}

// ---------------------------------------------------------------------------
// ValueTemplate
// ---------------------------------------------------------------------------

/// Field kind together with its comparison and interpolation rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueTemplate {
    Bool,
    Float,
    Vector,
    Transform,
    BodyState,
}

impl ValueTemplate {
    /// Whether `value` is of this kind.
    pub fn accepts(&self, value: &Value) -> bool {
        value.template() == *self
    }

    /// Bit-exact equality. `0.0` and `-0.0` differ; identical NaNs match.
    pub fn matches(&self, a: &Value, b: &Value) -> bool {
        match (a, b) {
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Vector(a), Value::Vector(b)) => vec3_bits_eq(*a, *b),
            (Value::Transform(a), Value::Transform(b)) => {
                vec3_bits_eq(a.translation, b.translation) && quat_bits_eq(a.rotation, b.rotation)
            }
            (Value::BodyState(a), Value::BodyState(b)) => {
                vec3_bits_eq(a.position, b.position)
                    && quat_bits_eq(a.orientation, b.orientation)
                    && vec3_bits_eq(a.linear_velocity, b.linear_velocity)
                    && vec3_bits_eq(a.angular_velocity, b.angular_velocity)
            }
            _ => false,
        }
    }

    /// Value at `time` given the newest sample `s0` and up to two older ones.
    ///
    /// At `time == s0.1` the result is `s0` unchanged. Linear kinds use the
    /// slope between `s0` and the newest strictly older sample; with no such
    /// sample they hold `s0`.
    pub fn extrapolate(
        &self,
        n2: Option<(&Value, f64)>,
        n1: Option<(&Value, f64)>,
        s0: (&Value, f64),
        time: f64,
    ) -> Value {
        let (v0, t0) = s0;
        let dt = time - t0;
        if dt == 0.0 {
            return *v0;
        }

        let previous = [n1, n2].into_iter().flatten().find(|(_, t)| *t < t0);
        let ratio = |t1: f64| (dt / (t0 - t1)) as f32;

        match (*v0, previous) {
            (Value::Bool(_), _) => *v0,
            (Value::Float(x0), Some((Value::Float(x1), t1))) => {
                Value::Float(x0 + (x0 - x1) * ratio(t1))
            }
            (Value::Vector(x0), Some((Value::Vector(x1), t1))) => {
                Value::Vector(x0 + (x0 - *x1) * ratio(t1))
            }
            (Value::Transform(a0), Some((Value::Transform(a1), t1))) => {
                let k = ratio(t1);
                Value::Transform(Transform {
                    translation: a0.translation + (a0.translation - a1.translation) * k,
                    rotation: extrapolate_rotation(a1.rotation, a0.rotation, k),
                })
            }
            (Value::BodyState(body), _) => Value::BodyState(body.integrate(dt as f32)),
            _ => *v0,
        }
    }

    /// Blend from `a` towards `b` by `k` in `[0, 1]`.
    pub fn lerp(&self, a: &Value, b: &Value, k: f32) -> Value {
        match (a, b) {
            (Value::Bool(_), Value::Bool(_)) => {
                if k < 0.5 {
                    *a
                } else {
                    *b
                }
            }
            (Value::Float(a), Value::Float(b)) => Value::Float(a + (b - a) * k),
            (Value::Vector(a), Value::Vector(b)) => Value::Vector(a.lerp(*b, k)),
            (Value::Transform(a), Value::Transform(b)) => Value::Transform(Transform {
                translation: a.translation.lerp(b.translation, k),
                rotation: a.rotation.slerp(b.rotation, k),
            }),
            (Value::BodyState(a), Value::BodyState(b)) => Value::BodyState(BodyState {
                position: a.position.lerp(b.position, k),
                orientation: a.orientation.slerp(b.orientation, k),
                linear_velocity: a.linear_velocity.lerp(b.linear_velocity, k),
                angular_velocity: a.angular_velocity.lerp(b.angular_velocity, k),
            }),
            _ => *a,
        }
    }
}

/// Continue the rotation from `q1` to `q0` by `k` times the same step.
fn extrapolate_rotation(q1: Quat, q0: Quat, k: f32) -> Quat {
    let mut delta = q0 * q1.conjugate();
    if delta.w < 0.0 {
        delta = -delta;
    }
    let (axis, angle) = delta.to_axis_angle();
    if angle.abs() < 1e-6 {
        return q0;
    }
    (Quat::from_axis_angle(axis, angle * k) * q0).normalize()
}

fn vec3_bits_eq(a: Vec3, b: Vec3) -> bool {
    a.to_array()
        .iter()
        .zip(b.to_array())
        .all(|(x, y)| x.to_bits() == y.to_bits())
}

fn quat_bits_eq(a: Quat, b: Quat) -> bool {
    a.to_array()
        .iter()
        .zip(b.to_array())
        .all(|(x, y)| x.to_bits() == y.to_bits())
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f32 = 1e-4;

    #[test]
    fn test_matches_is_bit_exact() {
        let t = ValueTemplate::Float;
        assert!(t.matches(&Value::Float(1.0), &Value::Float(1.0)));
        assert!(!t.matches(&Value::Float(0.0), &Value::Float(-0.0)));
        assert!(t.matches(&Value::Float(f32::NAN), &Value::Float(f32::NAN)));
        assert!(!t.matches(&Value::Float(1.0), &Value::Bool(true)));

        let v = ValueTemplate::Vector;
        assert!(!v.matches(
            &Value::Vector(Vec3::new(1.0, 2.0, 3.0)),
            &Value::Vector(Vec3::new(1.0, 2.0, 3.000_001))
        ));
    }

    #[test]
    fn test_extrapolate_at_sample_time_is_identity() {
        let v0 = Value::BodyState(BodyState {
            position: Vec3::new(1.0, 2.0, 3.0),
            orientation: Quat::from_rotation_y(0.3),
            linear_velocity: Vec3::X,
            angular_velocity: Vec3::Y,
        });
        let out = ValueTemplate::BodyState.extrapolate(None, None, (&v0, 2.5), 2.5);
        assert!(ValueTemplate::BodyState.matches(&out, &v0));
    }

    #[test]
    fn test_float_extrapolates_linearly() {
        let v1 = Value::Float(1.0);
        let v0 = Value::Float(2.0);
        let out = ValueTemplate::Float.extrapolate(None, Some((&v1, 0.0)), (&v0, 1.0), 1.5);
        assert!((out.as_float().unwrap() - 2.5).abs() < EPS);

        // Interpolation between samples uses the same rule.
        let out = ValueTemplate::Float.extrapolate(None, Some((&v1, 0.0)), (&v0, 1.0), 0.5);
        assert!((out.as_float().unwrap() - 1.5).abs() < EPS);
    }

    #[test]
    fn test_falls_back_to_older_sample_on_equal_times() {
        let v2 = Value::Vector(Vec3::ZERO);
        let v1 = Value::Vector(Vec3::X);
        let v0 = Value::Vector(Vec3::X * 2.0);
        let out = ValueTemplate::Vector.extrapolate(
            Some((&v2, 0.0)),
            Some((&v1, 1.0)),
            (&v0, 1.0),
            2.0,
        );
        assert!((out.as_vector().unwrap() - Vec3::X * 4.0).length() < EPS);
    }

    #[test]
    fn test_single_sample_holds_value() {
        let v0 = Value::Vector(Vec3::new(4.0, 5.0, 6.0));
        let out = ValueTemplate::Vector.extrapolate(None, None, (&v0, 0.0), 10.0);
        assert_eq!(out, v0);
    }

    #[test]
    fn test_bool_never_extrapolates() {
        let v1 = Value::Bool(false);
        let v0 = Value::Bool(true);
        let out = ValueTemplate::Bool.extrapolate(None, Some((&v1, 0.0)), (&v0, 1.0), 5.0);
        assert_eq!(out, Value::Bool(true));
    }

    #[test]
    fn test_transform_continues_rotation() {
        let a1 = Value::Transform(Transform::new(Vec3::ZERO, Quat::from_rotation_y(0.0)));
        let a0 = Value::Transform(Transform::new(Vec3::X, Quat::from_rotation_y(0.1)));
        let out = ValueTemplate::Transform
            .extrapolate(None, Some((&a1, 0.0)), (&a0, 1.0), 2.0)
            .as_transform()
            .unwrap();
        assert!((out.translation - Vec3::X * 2.0).length() < EPS);
        assert!(out.rotation.angle_between(Quat::from_rotation_y(0.2)) < EPS);
    }

    #[test]
    fn test_body_state_integrates_velocity() {
        let body = BodyState {
            position: Vec3::ZERO,
            orientation: Quat::IDENTITY,
            linear_velocity: Vec3::new(2.0, 0.0, 0.0),
            angular_velocity: Vec3::new(0.0, 1.0, 0.0),
        };
        let out = ValueTemplate::BodyState
            .extrapolate(None, None, (&Value::BodyState(body), 0.0), 0.5)
            .as_body_state()
            .unwrap();
        assert!((out.position - Vec3::new(1.0, 0.0, 0.0)).length() < EPS);
        assert!(out.orientation.angle_between(Quat::from_rotation_y(0.5)) < EPS);
        assert_eq!(out.linear_velocity, body.linear_velocity);
    }

    #[test]
    fn test_lerp_rules() {
        let t = ValueTemplate::Bool;
        assert_eq!(
            t.lerp(&Value::Bool(false), &Value::Bool(true), 0.4),
            Value::Bool(false)
        );
        assert_eq!(
            t.lerp(&Value::Bool(false), &Value::Bool(true), 0.6),
            Value::Bool(true)
        );

        let a = Value::Transform(Transform::IDENTITY);
        let b = Value::Transform(Transform::new(Vec3::Y * 2.0, Quat::from_rotation_x(1.0)));
        let mid = ValueTemplate::Transform
            .lerp(&a, &b, 0.5)
            .as_transform()
            .unwrap();
        assert!((mid.translation - Vec3::Y).length() < EPS);
        assert!(mid.rotation.angle_between(Quat::from_rotation_x(0.5)) < EPS);
    }

    #[test]
    fn test_transform_inverse_round_trip() {
        let frame = Transform::new(Vec3::new(3.0, -1.0, 2.0), Quat::from_rotation_z(0.7));
        let point = Vec3::new(1.0, 2.0, 3.0);
        let back = frame.inverse().transform_point(frame.transform_point(point));
        assert!((back - point).length() < EPS);

        let composed = frame.mul_transform(&frame.inverse());
        assert!(composed.translation.length() < EPS);
        assert!(composed.rotation.angle_between(Quat::IDENTITY) < EPS);
    }
}
