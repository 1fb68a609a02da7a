use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, IntoEnumIterator};

use crate::{
    fund::{Amount, SignedAmount},
    time::TimestampMillis,
};

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    AsRefStr,
)]
#[strum(serialize_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    Normal,
    Elevated,
    High,
    Critical,
}

impl RiskLevel {
    pub fn severity(&self) -> u8 {
        match self {
            Self::Normal => 1,
            Self::Elevated => 2,
            Self::High => 3,
            Self::Critical => 4,
        }
    }
}

// Whether a rising or a falling value is the dangerous direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdDirection {
    HigherIsWorse,
    LowerIsWorse,
}

// Three cut points mapped onto the four levels: inside `normal` is NORMAL,
// beyond it ELEVATED, beyond `warning` HIGH, beyond `critical` CRITICAL.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct IndicatorThresholds {
    pub normal: f64,
    pub warning: f64,
    pub critical: f64,
    pub direction: ThresholdDirection,
}

impl IndicatorThresholds {
    pub fn severity_of(&self, value: f64) -> RiskLevel {
        let breached = |bound: f64| match self.direction {
            ThresholdDirection::HigherIsWorse => value > bound,
            ThresholdDirection::LowerIsWorse => value < bound,
        };
        if breached(self.critical) {
            RiskLevel::Critical
        } else if breached(self.warning) {
            RiskLevel::High
        } else if breached(self.normal) {
            RiskLevel::Elevated
        } else {
            RiskLevel::Normal
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRefStr, EnumIter,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum IndicatorKind {
    L1Ratio,
    L1L2Ratio,
    RedemptionCoverage,
    LiquidityGap7d,
    NavVolatility24h,
    AssetPriceDeviation,
    OracleStaleness,
    SingleAssetConcentration,
    Top3Concentration,
    CounterpartyConcentration,
    DailyRedemptionRate,
    PendingApprovalRatio,
    RedemptionVelocity7d,
}

impl IndicatorKind {
    // Weights sum to 25 so a board of CRITICAL (severity 4) saturates at 100
    pub fn weight(&self) -> u8 {
        match self {
            Self::L1Ratio => 3,
            Self::L1L2Ratio => 2,
            Self::RedemptionCoverage => 3,
            Self::LiquidityGap7d => 2,
            Self::NavVolatility24h => 2,
            Self::AssetPriceDeviation => 2,
            Self::OracleStaleness => 1,
            Self::SingleAssetConcentration => 2,
            Self::Top3Concentration => 1,
            Self::CounterpartyConcentration => 1,
            Self::DailyRedemptionRate => 2,
            Self::PendingApprovalRatio => 1,
            Self::RedemptionVelocity7d => 3,
        }
    }

    pub fn default_thresholds(&self) -> IndicatorThresholds {
        use ThresholdDirection::*;
        match self {
            // Ratios of total assets
            Self::L1Ratio => IndicatorThresholds {
                normal: 0.10,
                warning: 0.07,
                critical: 0.05,
                direction: LowerIsWorse,
            },
            Self::L1L2Ratio => IndicatorThresholds {
                normal: 0.35,
                warning: 0.25,
                critical: 0.18,
                direction: LowerIsWorse,
            },
            // (L1 + L2) / liability
            Self::RedemptionCoverage => IndicatorThresholds {
                normal: 1.5,
                warning: 1.2,
                critical: 1.0,
                direction: LowerIsWorse,
            },
            // 7d funding gap as a fraction of total assets; negative is surplus
            Self::LiquidityGap7d => IndicatorThresholds {
                normal: 0.0,
                warning: 0.05,
                critical: 0.10,
                direction: HigherIsWorse,
            },
            Self::NavVolatility24h => IndicatorThresholds {
                normal: 0.005,
                warning: 0.02,
                critical: 0.05,
                direction: HigherIsWorse,
            },
            Self::AssetPriceDeviation => IndicatorThresholds {
                normal: 0.01,
                warning: 0.03,
                critical: 0.08,
                direction: HigherIsWorse,
            },
            // Seconds since the last accepted NAV update
            Self::OracleStaleness => IndicatorThresholds {
                normal: 3_600.0,
                warning: 21_600.0,
                critical: 86_400.0,
                direction: HigherIsWorse,
            },
            Self::SingleAssetConcentration => IndicatorThresholds {
                normal: 0.25,
                warning: 0.35,
                critical: 0.50,
                direction: HigherIsWorse,
            },
            Self::Top3Concentration => IndicatorThresholds {
                normal: 0.60,
                warning: 0.75,
                critical: 0.90,
                direction: HigherIsWorse,
            },
            Self::CounterpartyConcentration => IndicatorThresholds {
                normal: 0.30,
                warning: 0.40,
                critical: 0.55,
                direction: HigherIsWorse,
            },
            Self::DailyRedemptionRate => IndicatorThresholds {
                normal: 0.02,
                warning: 0.05,
                critical: 0.10,
                direction: HigherIsWorse,
            },
            Self::PendingApprovalRatio => IndicatorThresholds {
                normal: 0.30,
                warning: 0.50,
                critical: 0.70,
                direction: HigherIsWorse,
            },
            Self::RedemptionVelocity7d => IndicatorThresholds {
                normal: 0.08,
                warning: 0.15,
                critical: 0.25,
                direction: HigherIsWorse,
            },
        }
    }
}

// One value per indicator, computed each evaluation tick
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RiskIndicators {
    pub l1_ratio: f64,
    pub l1_l2_ratio: f64,
    pub redemption_coverage: f64,
    pub liquidity_gap_7d: f64,
    pub nav_volatility_24h: f64,
    pub asset_price_deviation: f64,
    pub oracle_staleness: f64,
    pub single_asset: f64,
    pub top3: f64,
    pub counterparty: f64,
    pub daily_redemption_rate: f64,
    pub pending_approval_ratio: f64,
    pub redemption_velocity_7d: f64,
}

impl RiskIndicators {
    pub fn value(&self, kind: IndicatorKind) -> f64 {
        match kind {
            IndicatorKind::L1Ratio => self.l1_ratio,
            IndicatorKind::L1L2Ratio => self.l1_l2_ratio,
            IndicatorKind::RedemptionCoverage => self.redemption_coverage,
            IndicatorKind::LiquidityGap7d => self.liquidity_gap_7d,
            IndicatorKind::NavVolatility24h => self.nav_volatility_24h,
            IndicatorKind::AssetPriceDeviation => self.asset_price_deviation,
            IndicatorKind::OracleStaleness => self.oracle_staleness,
            IndicatorKind::SingleAssetConcentration => self.single_asset,
            IndicatorKind::Top3Concentration => self.top3,
            IndicatorKind::CounterpartyConcentration => self.counterparty,
            IndicatorKind::DailyRedemptionRate => self.daily_redemption_rate,
            IndicatorKind::PendingApprovalRatio => self.pending_approval_ratio,
            IndicatorKind::RedemptionVelocity7d => self.redemption_velocity_7d,
        }
    }
}

pub type ThresholdTable = indexmap::IndexMap<IndicatorKind, IndicatorThresholds>;

pub fn default_threshold_table() -> ThresholdTable {
    IndicatorKind::iter()
        .map(|k| (k, k.default_thresholds()))
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskSnapshot {
    pub timestamp: TimestampMillis,
    pub indicators: RiskIndicators,
    pub risk_level: RiskLevel,
    // Weighted severity sum, clamped 0..100
    pub score: u8,
    // NAV per share at evaluation time; the volatility indicator reads this
    // series back out of the snapshot store
    #[serde(default)]
    pub share_price: Amount,
}

impl RiskSnapshot {
    // The snapshot's level is the max severity across indicators; the score
    // is the weighted severity sum.
    pub fn evaluate(
        indicators: RiskIndicators,
        thresholds: &ThresholdTable,
        timestamp: TimestampMillis,
        share_price: Amount,
    ) -> Self {
        let mut level = RiskLevel::Normal;
        let mut score: u32 = 0;
        for kind in IndicatorKind::iter() {
            let bounds = thresholds
                .get(&kind)
                .copied()
                .unwrap_or_else(|| kind.default_thresholds());
            let severity = bounds.severity_of(indicators.value(kind));
            if severity > level {
                level = severity;
            }
            score += kind.weight() as u32 * severity.severity() as u32;
        }

        Self {
            timestamp,
            indicators,
            risk_level: level,
            score: score.min(100) as u8,
            share_price,
        }
    }
}

// Operational risk event appended by handlers and engines
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskEvent {
    pub id: u64,
    pub level: RiskLevel,
    pub source: String,
    pub message: String,
    pub created_at: TimestampMillis,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
#[strum(serialize_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum ForecastHorizon {
    #[strum(serialize = "1D")]
    #[serde(rename = "1D")]
    OneDay,
    #[strum(serialize = "7D")]
    #[serde(rename = "7D")]
    SevenDays,
    #[strum(serialize = "30D")]
    #[serde(rename = "30D")]
    ThirtyDays,
}

impl ForecastHorizon {
    pub fn days(&self) -> u64 {
        match self {
            Self::OneDay => 1,
            Self::SevenDays => 7,
            Self::ThirtyDays => 30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ForecastRecommendation {
    None,
    Monitor,
    PrepareLiquidity,
    Emergency,
}

// < 5% NONE, < 20% MONITOR, < 50% PREPARE (suggested = |gap|),
// else EMERGENCY (suggested = 1.2 x |gap|)
pub fn recommendation_for(
    shortfall_probability: f64,
    gap: SignedAmount,
) -> (ForecastRecommendation, Amount) {
    let shortfall = gap.unsigned_abs();
    if shortfall_probability < 0.05 {
        (ForecastRecommendation::None, 0)
    } else if shortfall_probability < 0.20 {
        (ForecastRecommendation::Monitor, 0)
    } else if shortfall_probability < 0.50 {
        (ForecastRecommendation::PrepareLiquidity, shortfall)
    } else {
        (ForecastRecommendation::Emergency, shortfall + shortfall / 5)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiquidityForecast {
    pub horizon: ForecastHorizon,
    pub confirmed_outflow: Amount,
    pub probabilistic_outflow: Amount,
    pub expected_inflow: Amount,
    pub available_liquidity: Amount,
    pub shortfall_probability: f64,
    // available + inflow - outflow; negative means a funding hole
    pub gap: SignedAmount,
    pub recommendation: ForecastRecommendation,
    pub suggested_reserve: Amount,
    pub generated_at: TimestampMillis,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_directions() {
        let low_bad = IndicatorKind::L1Ratio.default_thresholds();
        assert_eq!(low_bad.severity_of(0.12), RiskLevel::Normal);
        assert_eq!(low_bad.severity_of(0.09), RiskLevel::Elevated);
        assert_eq!(low_bad.severity_of(0.06), RiskLevel::High);
        assert_eq!(low_bad.severity_of(0.04), RiskLevel::Critical);

        let high_bad = IndicatorKind::DailyRedemptionRate.default_thresholds();
        assert_eq!(high_bad.severity_of(0.01), RiskLevel::Normal);
        assert_eq!(high_bad.severity_of(0.12), RiskLevel::Critical);
    }

    #[test]
    fn snapshot_level_is_max_severity() {
        let mut indicators = healthy_indicators();
        indicators.l1_ratio = 0.04; // critical
        let snapshot = RiskSnapshot::evaluate(indicators, &default_threshold_table(), 0, 0);
        assert_eq!(snapshot.risk_level, RiskLevel::Critical);
    }

    #[test]
    fn healthy_board_scores_at_floor() {
        let snapshot =
            RiskSnapshot::evaluate(healthy_indicators(), &default_threshold_table(), 0, 0);
        assert_eq!(snapshot.risk_level, RiskLevel::Normal);
        // all severities 1, weighted sum = 25
        assert_eq!(snapshot.score, 25);
    }

    #[test]
    fn weights_sum_to_quarter_scale() {
        let total: u32 = IndicatorKind::iter().map(|k| k.weight() as u32).sum();
        assert_eq!(total, 25);
    }

    #[test]
    fn recommendation_bands() {
        assert_eq!(recommendation_for(0.01, -100).0, ForecastRecommendation::None);
        assert_eq!(recommendation_for(0.10, -100).0, ForecastRecommendation::Monitor);
        let (rec, suggested) = recommendation_for(0.30, -100);
        assert_eq!(rec, ForecastRecommendation::PrepareLiquidity);
        assert_eq!(suggested, 100);
        let (rec, suggested) = recommendation_for(0.80, -100);
        assert_eq!(rec, ForecastRecommendation::Emergency);
        assert_eq!(suggested, 120);
    }

    fn healthy_indicators() -> RiskIndicators {
        RiskIndicators {
            l1_ratio: 0.15,
            l1_l2_ratio: 0.45,
            redemption_coverage: 2.0,
            liquidity_gap_7d: -0.02,
            nav_volatility_24h: 0.001,
            asset_price_deviation: 0.002,
            oracle_staleness: 60.0,
            single_asset: 0.15,
            top3: 0.40,
            counterparty: 0.20,
            daily_redemption_rate: 0.005,
            pending_approval_ratio: 0.10,
            redemption_velocity_7d: 0.03,
        }
    }
}
