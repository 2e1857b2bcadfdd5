//! Random-walk mobility for traveller nodes.
//!
//! Each node moves at constant velocity in a uniformly random direction
//! and picks a new direction after covering a configured distance
//! (distance mode) or after a configured period (time mode). The
//! simulation area boundary reflects movement like a mirror.

use rand::Rng;
use std::f64::consts::PI;

use crate::config::WalkMode;
use crate::simulation::types::Point;

#[derive(Debug)]
pub struct Walker {
    velocity: f64,
    walk_dist: f64,
    walk_time: f64,
    mode: WalkMode,
    direction: f64,
    travelled: f64,
    elapsed: f64,
}

impl Walker {
    pub fn new(
        velocity: f64,
        walk_dist: f64,
        walk_time: f64,
        mode: WalkMode,
        rng: &mut impl Rng,
    ) -> Self {
        Self {
            velocity,
            walk_dist,
            walk_time,
            mode,
            direction: rng.gen_range(0.0..2.0 * PI),
            travelled: 0.0,
            elapsed: 0.0,
        }
    }

    /// Advance `position` by `dt` seconds of walking within the
    /// `width` x `length` area.
    pub fn step(
        &mut self,
        position: &mut Point,
        dt: f64,
        width: f64,
        length: f64,
        rng: &mut impl Rng,
    ) {
        if self.velocity == 0.0 || dt <= 0.0 {
            return;
        }

        let leg_over = match self.mode {
            WalkMode::Distance => self.travelled >= self.walk_dist,
            WalkMode::Time => self.elapsed >= self.walk_time,
        };
        if leg_over {
            self.direction = rng.gen_range(0.0..2.0 * PI);
            self.travelled = 0.0;
            self.elapsed = 0.0;
        }

        let step = self.velocity * dt;
        position.x += step * self.direction.cos();
        position.y += step * self.direction.sin();
        self.travelled += step;
        self.elapsed += dt;

        // Reflect off the area boundary.
        if position.x < 0.0 {
            position.x = -position.x;
            self.direction = PI - self.direction;
        } else if position.x > width {
            position.x = 2.0 * width - position.x;
            self.direction = PI - self.direction;
        }
        if position.y < 0.0 {
            position.y = -position.y;
            self.direction = -self.direction;
        } else if position.y > length {
            position.y = 2.0 * length - position.y;
            self.direction = -self.direction;
        }
        self.direction = self.direction.rem_euclid(2.0 * PI);
    }
}
