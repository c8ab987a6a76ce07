//! Glicko-2 rating updates.
//!
//! Ported from the teacher's `player::mmr::glicko2`, generalized from one
//! rating period's worth of matchups to a single match's worth (the ranked
//! coordinator calls this once per concluded match, not once per period)
//! and widened from `f32` to `f64` to match [`turnkeep_model::ranked::PlayerRating`]'s
//! wire precision.

use std::f64::consts::PI;

use turnkeep_model::ranked::PlayerRating;

use crate::config::MmrConfig;

pub const CONVERGENCE_TOLERANCE: f64 = 0.000_001;

/// A single opponent's rating at match time, plus the score the subject
/// player earned against them (1 win, 0.5 draw, 0 loss).
#[derive(Clone, Copy, Debug)]
pub struct Opponent {
    pub rating: f64,
    pub deviation: f64,
    pub volatility: f64,
    pub score: f64,
}

/// The result of rating one player against one or more opponents in a
/// single match.
#[derive(Clone, Copy, Debug)]
pub struct RatedOutcome {
    pub rating: f64,
    pub deviation: f64,
    pub volatility: f64,
}

/// Rates a player's performance in one match against `opponents`.
///
/// `fractional_period` is how much of a full rating period this single
/// match counts as; the ranked coordinator always passes `1.0` since a
/// match is its own complete window, not a slice of a longer period.
pub fn rate(
    config: &MmrConfig,
    subject: &PlayerRating,
    opponents: &[Opponent],
    fractional_period: f64,
) -> RatedOutcome {
    assert!((0.0..=1.0).contains(&fractional_period));

    let (mu, phi) = to_glicko2(subject);

    if opponents.is_empty() {
        let new_phi = pre_rating_period_value(subject.volatility, phi, fractional_period);
        let deviation = (new_phi * 173.7178).min(config.defaults.deviation);
        return RatedOutcome {
            rating: subject.rating,
            deviation,
            volatility: subject.volatility,
        };
    }

    let v = opponents
        .iter()
        .map(|opponent| {
            let opponent_phi = opponent.deviation / 173.7178;
            let opponent_mu = (opponent.rating - 1500.0) / 173.7178;

            let g = g_func(opponent_phi);
            let e = e_func(mu, opponent_mu, g);

            g * g * e * (1.0 - e)
        })
        .sum::<f64>()
        .recip();

    let scores = opponents
        .iter()
        .map(|opponent| {
            let opponent_phi = opponent.deviation / 173.7178;
            let opponent_mu = (opponent.rating - 1500.0) / 173.7178;

            let g = g_func(opponent_phi);
            let e = e_func(mu, opponent_mu, g);

            g * (opponent.score - e)
        })
        .sum::<f64>();
    let delta = v * scores;

    let new_volatility = iterate_new_volatility(v, delta, phi, subject.volatility, config.tau);

    let pre_rating = pre_rating_period_value(new_volatility, phi, fractional_period);

    let new_phi = (pre_rating.powi(2).recip() + v.recip()).sqrt().recip();
    let new_mu = new_phi.powi(2).mul_add(scores, mu);

    RatedOutcome {
        rating: new_mu.mul_add(173.7178, 1500.0),
        deviation: new_phi * 173.7178,
        volatility: new_volatility,
    }
}

fn pre_rating_period_value(new_volatility: f64, phi: f64, fractional_period: f64) -> f64 {
    (phi.powi(2) + fractional_period * new_volatility.powi(2)).sqrt()
}

fn iterate_new_volatility(v: f64, delta: f64, phi: f64, volatility: f64, tau: f64) -> f64 {
    let phi_squared = phi.powi(2);
    let delta_squared = delta.powi(2);

    let mut a = f64::ln(volatility.powi(2));

    let f = move |x: f64| {
        let x_exp = f64::exp(x);

        let tmp_1 = x_exp * (delta_squared - phi_squared - v - x_exp);
        let tmp_2 = 2.0 * (phi_squared + v + x_exp).powi(2);
        let tmp_3 = x - a;
        let tmp_4 = tau.powi(2);

        tmp_1 / tmp_2 - tmp_3 / tmp_4
    };

    let mut b = if delta_squared > phi_squared + v {
        f64::ln(delta_squared - phi_squared - v)
    } else {
        let mut k = 1.0f64;
        while f(a - k * tau) < 0.0 {
            k += 1.0;
        }
        a - k * tau
    };

    let mut f_a = f(a);
    let mut f_b = f(b);

    while (b - a).abs() > CONVERGENCE_TOLERANCE {
        let c = a + (a - b) * f_a / (f_b - f_a);
        let f_c = f(c);

        if f_c * f_b <= 0.0 {
            a = b;
            f_a = f_b;
        } else {
            f_a /= 2.0;
        }

        b = c;
        f_b = f_c;
    }

    f64::exp(a / 2.0)
}

fn e_func(mu: f64, opponent_mu: f64, g: f64) -> f64 {
    (1.0 + f64::exp(-g * (mu - opponent_mu))).recip()
}

fn g_func(phi: f64) -> f64 {
    (1.0 + 3.0 * phi.powi(2) / PI.powi(2)).sqrt().recip()
}

fn to_glicko2(rating: &PlayerRating) -> (f64, f64) {
    let mu = (rating.rating - 1500.0) / 173.7178;
    let phi = rating.deviation / 173.7178;
    (mu, phi)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use turnkeep_model::session::PersistentId;

    fn rating(rating: f64, deviation: f64, volatility: f64) -> PlayerRating {
        PlayerRating {
            persistent_id: PersistentId("p".into()),
            season_id: "s1".into(),
            rating,
            deviation,
            volatility,
            updated_at: Utc::now(),
        }
    }

    /// Test taken directly from the Glicko-2 specification.
    #[test]
    fn glicko2_spec_example() {
        let config = MmrConfig::default();

        let subject = rating(1500.0, 200.0, 0.06);
        let opponents = vec![
            Opponent { rating: 1400.0, deviation: 30.0, volatility: 0.06, score: 1.0 },
            Opponent { rating: 1550.0, deviation: 100.0, volatility: 0.06, score: 0.0 },
            Opponent { rating: 1700.0, deviation: 300.0, volatility: 0.06, score: 0.0 },
        ];

        let result = rate(&config, &subject, &opponents, 1.0);

        assert!((result.rating - 1464.06).abs() < 0.01);
        assert!((result.deviation - 151.52).abs() < 0.01);
        assert!((result.volatility - 0.059_99).abs() < 0.000_01);
    }

    #[test]
    fn symmetric_single_match_win_raises_winner_lowers_loser() {
        let config = MmrConfig::default();
        let a = rating(1500.0, 350.0, 0.06);
        let b = rating(1500.0, 350.0, 0.06);

        let a_result = rate(
            &config,
            &a,
            &[Opponent { rating: b.rating, deviation: b.deviation, volatility: b.volatility, score: 1.0 }],
            1.0,
        );
        let b_result = rate(
            &config,
            &b,
            &[Opponent { rating: a.rating, deviation: a.deviation, volatility: a.volatility, score: 0.0 }],
            1.0,
        );

        assert!(a_result.rating > a.rating);
        assert!(b_result.rating < b.rating);
        assert!((a_result.rating - a.rating) > 0.0);
    }

    #[test]
    fn no_matches_only_decays_deviation() {
        let config = MmrConfig::default();
        let subject = rating(1600.0, 80.0, 0.06);

        let result = rate(&config, &subject, &[], 1.0);

        assert_eq!(result.rating, subject.rating);
        assert!(result.deviation > subject.deviation);
    }
}
