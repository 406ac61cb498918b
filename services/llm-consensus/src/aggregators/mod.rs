// Multi-provider aggregation logic
use crate::types::*;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use tracing::info;

/// Weighted sums closer than this (relative) are treated as a tie
const TIE_EPSILON: f64 = 1e-9;

/// Weight applied to providers missing from the weight table
pub const DEFAULT_WEIGHT: f64 = 1.0;

#[derive(Debug, Clone, Copy)]
struct Tally {
    decision: Decision,
    /// Sum of weight × confidence
    weighted: f64,
    /// Sum of weights of the voters
    support: f64,
    votes: usize,
    /// Position of the first voter in provider priority order
    first_rank: usize,
}

/// Aggregate validated signals using weighted voting.
///
/// `signals` must be in provider priority order (registration order), not
/// completion order: the final tie-break depends on it. The output is a
/// pure function of the inputs. Fan-out bookkeeping (`failures`,
/// `meets_thresholds`) is left for the caller to fill in.
pub fn aggregate(
    signals: &[Signal],
    weights: &HashMap<String, f64>,
    total_providers: usize,
) -> Result<ConsensusResult> {
    if signals.is_empty() {
        return Err(ConsensusError::NoProvidersAvailable { failures: Vec::new() });
    }

    let weight_of = |s: &Signal| weights.get(&s.provider_id).copied().unwrap_or(DEFAULT_WEIGHT);

    let mut total_weight = 0.0;
    for signal in signals {
        let w = weight_of(signal);
        if !w.is_finite() || w < 0.0 {
            return Err(ConsensusError::InvalidConfiguration(format!(
                "invalid weight {} for provider {}",
                w, signal.provider_id
            )));
        }
        total_weight += w;
    }

    if total_weight <= 0.0 {
        return Err(ConsensusError::InvalidConfiguration(
            "participating provider weights sum to zero".to_string(),
        ));
    }

    let mut tallies: Vec<Tally> = Decision::ALL
        .iter()
        .map(|&decision| Tally {
            decision,
            weighted: 0.0,
            support: 0.0,
            votes: 0,
            first_rank: usize::MAX,
        })
        .collect();

    for (rank, signal) in signals.iter().enumerate() {
        let w = weight_of(signal);
        if let Some(t) = tallies.iter_mut().find(|t| t.decision == signal.decision) {
            t.weighted += w * signal.confidence;
            t.support += w;
            t.votes += 1;
            t.first_rank = t.first_rank.min(rank);
        }
    }

    let winner = pick_winner(&tallies);
    let winning = tallies
        .iter()
        .find(|t| t.decision == winner)
        .copied()
        .ok_or_else(|| ConsensusError::NoProvidersAvailable { failures: Vec::new() })?;

    let confidence = (winning.weighted / total_weight).clamp(0.0, 1.0);
    let agreement_score = (winning.support / total_weight).clamp(0.0, 1.0);

    let supporters: Vec<&Signal> = signals.iter().filter(|s| s.decision == winner).collect();

    let vote_breakdown: BTreeMap<Decision, usize> =
        tallies.iter().map(|t| (t.decision, t.votes)).collect();
    let weighted_vote_breakdown: BTreeMap<Decision, f64> =
        tallies.iter().map(|t| (t.decision, t.weighted)).collect();

    let risk_level = aggregate_risk_level(&supporters);
    let reasoning = aggregate_reasoning(winner, &supporters, signals.len(), &weighted_vote_breakdown);

    let result = ConsensusResult {
        decision: winner,
        confidence,
        agreement_score,
        vote_breakdown,
        weighted_vote_breakdown,
        participating_providers: signals.len(),
        total_providers: total_providers.max(signals.len()),
        risk_level,
        reasoning,
        suggested_stop_loss: mean(supporters.iter().filter_map(|s| s.suggested_stop_loss)),
        suggested_take_profit: mean(supporters.iter().filter_map(|s| s.suggested_take_profit)),
        total_latency_ms: signals
            .iter()
            .filter_map(|s| s.latency_ms)
            .fold(None, |acc: Option<f64>, v| Some(acc.map_or(v, |a| a.max(v)))),
        total_cost_usd: signals.iter().filter_map(|s| s.cost_usd).sum(),
        total_tokens: signals
            .iter()
            .filter_map(|s| s.tokens_used)
            .fold(0u64, u64::saturating_add),
        meets_thresholds: false,
        signals: signals.to_vec(),
        failures: Vec::new(),
        timestamp: Utc::now(),
    };

    info!(
        decision = %result.decision,
        confidence = result.confidence,
        agreement = result.agreement_score,
        providers = result.participating_providers,
        "Consensus aggregated"
    );

    Ok(result)
}

/// Largest weighted sum wins. Exact ties go to HOLD when HOLD is among them,
/// then to the higher raw vote count, then to whichever decision's first
/// voter comes earliest in priority order.
fn pick_winner(tallies: &[Tally]) -> Decision {
    let candidates: Vec<&Tally> = tallies.iter().filter(|t| t.votes > 0).collect();

    let best = candidates
        .iter()
        .map(|t| t.weighted)
        .fold(f64::NEG_INFINITY, f64::max);
    let tolerance = TIE_EPSILON * best.abs().max(1.0);

    let tied: Vec<&Tally> = candidates
        .into_iter()
        .filter(|t| (best - t.weighted).abs() <= tolerance)
        .collect();

    if tied.iter().any(|t| t.decision == Decision::Hold) {
        return Decision::Hold;
    }

    tied.iter()
        .min_by(|a, b| b.votes.cmp(&a.votes).then(a.first_rank.cmp(&b.first_rank)))
        .map(|t| t.decision)
        .unwrap_or(Decision::Hold)
}

/// Majority risk level among the winning voters, ties toward more caution
fn aggregate_risk_level(supporters: &[&Signal]) -> RiskLevel {
    let mut best = RiskLevel::Medium;
    let mut best_count = 0usize;

    for level in [RiskLevel::High, RiskLevel::Medium, RiskLevel::Low] {
        let count = supporters.iter().filter(|s| s.risk_level == level).count();
        if count > best_count {
            best = level;
            best_count = count;
        }
    }

    best
}

fn aggregate_reasoning(
    winner: Decision,
    supporters: &[&Signal],
    participating: usize,
    weighted: &BTreeMap<Decision, f64>,
) -> String {
    let breakdown = Decision::ALL
        .iter()
        .map(|d| format!("{}={:.2}", d, weighted.get(d).copied().unwrap_or(0.0)))
        .collect::<Vec<_>>()
        .join(", ");

    let mut reasoning = format!(
        "{} consensus ({}/{} providers agree; weighted votes {})",
        winner,
        supporters.len(),
        participating,
        breakdown
    );

    // Most confident supporter speaks for the group; earliest wins ties
    let lead = supporters.iter().fold(None::<&&Signal>, |acc, s| match acc {
        Some(best) if best.confidence >= s.confidence => Some(best),
        _ => Some(s),
    });

    if let Some(lead) = lead.filter(|s| !s.reasoning.is_empty()) {
        reasoning.push_str(&format!(": [{}] {}", lead.provider_id, lead.reasoning));
    }

    reasoning
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values.fold((0.0, 0usize), |(sum, n), v| (sum + v, n + 1));
    if count == 0 {
        None
    } else {
        Some(sum / count as f64)
    }
}
