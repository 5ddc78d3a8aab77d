// Copyright 2025 the Vellum Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Lookup tables for feathered (gaussian-blurred) coverage.
//!
//! Feathering convolves the path's coverage with a normal distribution. The shaders sample a
//! 1D texture holding the integral of that distribution, and the atlas pass uses its inverse.
//! Both tables span `±FEATHER_TEXTURE_STDDEVS` standard deviations.

use std::sync::OnceLock;

use half::f16;

pub const GAUSSIAN_TABLE_SIZE: usize = 512;
pub const FEATHER_TEXTURE_STDDEVS: f32 = 3.;

const ONE_OVER_SQRT_2_PI: f32 = 0.398_942_3;

fn eval_normal_distribution(x: f32, mu: f32, inverse_sigma: f32) -> f32 {
    let y = (x - mu) * inverse_sigma;
    (-0.5 * y * y).exp() * inverse_sigma * ONE_OVER_SQRT_2_PI
}

fn sigma() -> f32 {
    GAUSSIAN_TABLE_SIZE as f32 / (FEATHER_TEXTURE_STDDEVS * 2.)
}

fn generate_integral_table() -> [f32; GAUSSIAN_TABLE_SIZE] {
    const SAMPLES: i32 = 7;
    let inverse_sigma = 1. / sigma();
    let mu = GAUSSIAN_TABLE_SIZE as f32 * 0.5;
    let mut table = [0_f32; GAUSSIAN_TABLE_SIZE];
    let mut integral = 0.;
    for (i, entry) in table.iter_mut().enumerate() {
        // Several samples per bar give a more accurate integral.
        let bar_center_x = i as f32;
        for sample in 0..SAMPLES {
            let dx = (sample - (SAMPLES >> 1)) as f32 / SAMPLES as f32;
            integral += eval_normal_distribution(bar_center_x + dx, mu, inverse_sigma)
                / SAMPLES as f32;
        }
        *entry = integral;
    }
    // Account for the area under the curve before the table starts, so the middle of the
    // table is exactly 1/2.
    let middle = if GAUSSIAN_TABLE_SIZE & 1 == 1 {
        table[GAUSSIAN_TABLE_SIZE / 2]
    } else {
        (table[GAUSSIAN_TABLE_SIZE / 2 - 1] + table[GAUSSIAN_TABLE_SIZE / 2]) / 2.
    };
    let shift = 0.5 - middle;
    table[0] = (table[0] + shift).clamp(0., 1.);
    for i in 1..GAUSSIAN_TABLE_SIZE {
        table[i] = (table[i] + shift).max(table[i - 1]).min(1.);
    }
    table
}

fn generate_inverse_integral_table() -> [f32; GAUSSIAN_TABLE_SIZE] {
    const MULTIPLIER: usize = 32;
    let inverse_sigma = 1. / sigma();
    let mu = GAUSSIAN_TABLE_SIZE as f32 * 0.5;
    let samples = GAUSSIAN_TABLE_SIZE * MULTIPLIER;

    // Integrate half the curve to find the integral's value where the table begins.
    let mut integral = 0.;
    for i in 0..samples.div_ceil(2) {
        let bar_center_x = i as f32 / MULTIPLIER as f32;
        integral +=
            eval_normal_distribution(bar_center_x, mu, inverse_sigma) / MULTIPLIER as f32;
    }
    integral = 0.5 - integral;

    let mut table = [0_f32; GAUSSIAN_TABLE_SIZE];
    table[GAUSSIAN_TABLE_SIZE - 1] = 1.;
    let mut last_inverse_x = f32::NAN;
    let mut last_inverse_y = 0.;
    for i in 0..samples {
        let bar_center_x = i as f32 / MULTIPLIER as f32;
        integral +=
            eval_normal_distribution(bar_center_x, mu, inverse_sigma) / MULTIPLIER as f32;
        let inverse_x = integral.clamp(0., 1.) * GAUSSIAN_TABLE_SIZE as f32;
        let inverse_y = (i as f32 + 0.5) / samples as f32;
        let cell = inverse_x as usize;
        let cell_center_x = cell as f32 + 0.5;
        // NaN on the first sample fails this comparison.
        if cell < GAUSSIAN_TABLE_SIZE
            && last_inverse_x <= cell_center_x
            && inverse_x >= cell_center_x
        {
            let t = (cell_center_x - last_inverse_x) / (inverse_x - last_inverse_x);
            table[cell] = last_inverse_y + (inverse_y - last_inverse_y) * t;
        }
        last_inverse_x = inverse_x;
        last_inverse_y = inverse_y;
    }
    table
}

/// The integral of the normal distribution from `-3σ` to `+3σ`, clamped to `[0, 1]`.
pub fn gaussian_integral_table() -> &'static [f32; GAUSSIAN_TABLE_SIZE] {
    static TABLE: OnceLock<[f32; GAUSSIAN_TABLE_SIZE]> = OnceLock::new();
    TABLE.get_or_init(generate_integral_table)
}

/// The inverse of [`gaussian_integral_table`], mapping coverage back to distance.
pub fn inverse_gaussian_integral_table() -> &'static [f32; GAUSSIAN_TABLE_SIZE] {
    static TABLE: OnceLock<[f32; GAUSSIAN_TABLE_SIZE]> = OnceLock::new();
    TABLE.get_or_init(generate_inverse_integral_table)
}

/// [`gaussian_integral_table`] as half-float bits, ready for a 16-bit float texture.
pub fn gaussian_integral_table_f16() -> &'static [u16; GAUSSIAN_TABLE_SIZE] {
    static TABLE: OnceLock<[u16; GAUSSIAN_TABLE_SIZE]> = OnceLock::new();
    TABLE.get_or_init(|| to_f16_bits(gaussian_integral_table()))
}

pub fn inverse_gaussian_integral_table_f16() -> &'static [u16; GAUSSIAN_TABLE_SIZE] {
    static TABLE: OnceLock<[u16; GAUSSIAN_TABLE_SIZE]> = OnceLock::new();
    TABLE.get_or_init(|| to_f16_bits(inverse_gaussian_integral_table()))
}

fn to_f16_bits(table: &[f32; GAUSSIAN_TABLE_SIZE]) -> [u16; GAUSSIAN_TABLE_SIZE] {
    table.map(|x| f16::from_f32(x).to_bits())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integral_is_monotonic_and_centered() {
        let table = gaussian_integral_table();
        assert!(table.windows(2).all(|w| w[0] <= w[1]));
        // The area below -3σ is about 0.00135.
        assert!(table[0] > 0.0005 && table[0] < 0.003, "{}", table[0]);
        assert!(table[GAUSSIAN_TABLE_SIZE - 1] > 0.997);
        let middle = (table[GAUSSIAN_TABLE_SIZE / 2 - 1] + table[GAUSSIAN_TABLE_SIZE / 2]) / 2.;
        assert!((middle - 0.5).abs() < 1e-5);
    }

    #[test]
    fn inverse_spans_zero_to_one() {
        let table = inverse_gaussian_integral_table();
        assert_eq!(table[0], 0.);
        assert_eq!(table[GAUSSIAN_TABLE_SIZE - 1], 1.);
        assert!(table.windows(2).all(|w| w[0] <= w[1]));
        let middle = table[GAUSSIAN_TABLE_SIZE / 2];
        assert!((middle - 0.5).abs() < 0.01, "{middle}");
    }

    #[test]
    fn half_float_tables_match() {
        let bits = gaussian_integral_table_f16();
        let table = gaussian_integral_table();
        for (b, x) in bits.iter().zip(table) {
            assert!((f16::from_bits(*b).to_f32() - x).abs() < 1e-3);
        }
        assert_eq!(inverse_gaussian_integral_table_f16()[0], 0);
    }
}
