// Liquidity forecasting: confirmed outflow plus historical-rate projections,
// with a Monte-Carlo shortfall probability over both.

use log::info;
use rand::{rngs::StdRng, Rng, SeedableRng};

use meridian_common::{
    config::{MONTE_CARLO_TRIALS, SECONDS_PER_DAY},
    fund::{Amount, RedemptionStatus, Tier},
    risk::{recommendation_for, ForecastHorizon, ForecastRecommendation, LiquidityForecast, RiskLevel},
    time::{get_current_time_in_millis, get_current_time_in_seconds},
};

use crate::{
    chain::ChainGateway,
    core::storage::Storage,
    notify::{NotifyChannel, NotifyLevel},
};

use super::{RiskEngine, RiskError};

// Historical rates are read off the trailing 30 days of gross flows
const RATE_LOOKBACK_DAYS: u64 = 30;

impl<S: Storage, G: ChainGateway> RiskEngine<S, G> {
    pub async fn forecast(&self, horizon: ForecastHorizon) -> Result<LiquidityForecast, RiskError> {
        let projection = self.storage.get_fund_projection().await?;
        let now = get_current_time_in_millis();
        let horizon_ms = horizon.days() * SECONDS_PER_DAY * 1_000;

        // Confirmed: requests settling inside the horizon that still owe cash
        let settling = self
            .storage
            .list_redemptions_settling_before(now + horizon_ms)
            .await?;
        let confirmed_outflow: Amount = settling
            .iter()
            .filter(|r| {
                !matches!(
                    r.status,
                    RedemptionStatus::Settled | RedemptionStatus::Cancelled
                )
            })
            .map(|r| r.gross_amount)
            .sum();

        // Probabilistic legs from trailing-month rates, inflow discounted 50%
        let today = get_current_time_in_seconds() / SECONDS_PER_DAY;
        let flows = self
            .storage
            .daily_flows_range(today.saturating_sub(RATE_LOOKBACK_DAYS - 1), today)
            .await?;
        let redemptions_month: Amount = flows.iter().map(|f| f.redemptions).sum();
        let deposits_month: Amount = flows.iter().map(|f| f.deposits).sum();
        let probabilistic_outflow =
            redemptions_month * horizon.days() as u128 / RATE_LOOKBACK_DAYS as u128;
        let expected_inflow =
            deposits_month * horizon.days() as u128 / RATE_LOOKBACK_DAYS as u128 / 2;

        let available_liquidity = projection.tier_value(Tier::L1) + projection.l2;
        let total_outflow = confirmed_outflow + probabilistic_outflow;

        // Production paths draw from entropy; tests exercise the seeded
        // variant of the sampler directly
        let mut rng = StdRng::from_entropy();
        let shortfall_probability = shortfall_probability(
            available_liquidity,
            total_outflow,
            expected_inflow,
            MONTE_CARLO_TRIALS,
            &mut rng,
        );

        let gap = available_liquidity as i128 + expected_inflow as i128 - total_outflow as i128;
        let (recommendation, suggested_reserve) = recommendation_for(shortfall_probability, gap);

        let forecast = LiquidityForecast {
            horizon,
            confirmed_outflow,
            probabilistic_outflow,
            expected_inflow,
            available_liquidity,
            shortfall_probability,
            gap,
            recommendation,
            suggested_reserve,
            generated_at: now,
        };

        info!(
            "liquidity forecast {}: shortfall p={:.3}, recommendation {}",
            horizon, shortfall_probability, recommendation
        );

        match recommendation {
            ForecastRecommendation::PrepareLiquidity => {
                self.record_risk_event(
                    RiskLevel::Elevated,
                    "forecast",
                    &format!(
                        "{} forecast suggests preparing {} of liquidity",
                        horizon, suggested_reserve
                    ),
                )
                .await?;
            }
            ForecastRecommendation::Emergency => {
                self.record_risk_event(
                    RiskLevel::High,
                    "forecast",
                    &format!(
                        "{} forecast shortfall probability {:.0}%",
                        horizon,
                        shortfall_probability * 100.0
                    ),
                )
                .await?;
                self.notifier
                    .notify(
                        NotifyLevel::Critical,
                        NotifyChannel::FundManager,
                        "liquidity forecast critical",
                        &format!(
                            "{} horizon shortfall probability {:.0}%, suggested reserve {}",
                            horizon,
                            shortfall_probability * 100.0,
                            suggested_reserve
                        ),
                    )
                    .await;
            }
            _ => {}
        }

        Ok(forecast)
    }
}

// 1,000 trials by default: outflow scaled U(0.8, 1.2), inflow U(0.5, 1.5),
// a trial is a shortfall when available + inflow' < outflow'
pub fn shortfall_probability<R: Rng>(
    available: Amount,
    outflow: Amount,
    inflow: Amount,
    trials: u32,
    rng: &mut R,
) -> f64 {
    if trials == 0 {
        return 0.0;
    }
    let available = available as f64;
    let outflow = outflow as f64;
    let inflow = inflow as f64;

    let mut shortfalls = 0u32;
    for _ in 0..trials {
        let outflow_draw = outflow * rng.gen_range(0.8..1.2);
        let inflow_draw = inflow * rng.gen_range(0.5..1.5);
        if available + inflow_draw < outflow_draw {
            shortfalls += 1;
        }
    }
    shortfalls as f64 / trials as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> StdRng {
        StdRng::seed_from_u64(42)
    }

    #[test]
    fn ample_liquidity_never_falls_short() {
        let p = shortfall_probability(10_000_000, 1_000_000, 0, 1_000, &mut seeded());
        assert_eq!(p, 0.0);
    }

    #[test]
    fn hopeless_position_always_falls_short() {
        // even the luckiest draw (0.8x outflow, 1.5x inflow) cannot cover
        let p = shortfall_probability(100, 10_000, 100, 1_000, &mut seeded());
        assert_eq!(p, 1.0);
    }

    #[test]
    fn borderline_position_is_probabilistic() {
        // available exactly at the mean outflow: roughly half the draws fail
        let p = shortfall_probability(1_000_000, 1_000_000, 0, 1_000, &mut seeded());
        assert!(p > 0.3 && p < 0.7, "p = {}", p);
    }

    #[test]
    fn seeded_runs_are_reproducible() {
        let a = shortfall_probability(1_000_000, 1_000_000, 200_000, 1_000, &mut seeded());
        let b = shortfall_probability(1_000_000, 1_000_000, 200_000, 1_000, &mut seeded());
        assert_eq!(a, b);
    }
}
