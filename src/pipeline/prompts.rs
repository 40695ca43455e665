//! Prompt construction for every worker kind.
//!
//! Prompts ask for JSON matching the worker's declared schema; the wrapper
//! enforces conformance, so the texts here focus on the analytical task.

use crate::llm::schema::{FactorCandidate, FactorRating};
use crate::models::{FactorRow, ForecasterClass, QuestionType};

pub fn discovery_system() -> String {
    "You are a forecasting analyst identifying the drivers behind a question. \
     Propose up to 5 distinct, concrete factors that will influence the outcome. \
     Each factor needs a short name, a one-paragraph description, and a category \
     (economic, political, technological, social, environmental, or general). \
     Prefer factors with observable evidence over vague themes. \
     Respond with JSON only."
        .to_string()
}

pub fn discovery_user(question: &str, question_type: QuestionType) -> String {
    format!(
        "Forecasting question ({}): {question}\n\nList the factors most likely to \
         decide this outcome.",
        question_type.as_str()
    )
}

pub fn validator_system() -> String {
    "You are reviewing factor candidates proposed by a panel of analysts. \
     Merge duplicates and near-duplicates into single factors, keeping the more \
     specific description when two overlap. Drop candidates that are not real \
     drivers of the question. Return the deduplicated list as JSON."
        .to_string()
}

pub fn validator_user(question: &str, candidates: &[FactorCandidate]) -> String {
    let listing = serde_json::to_string_pretty(candidates).unwrap_or_else(|_| "[]".to_string());
    format!(
        "Question: {question}\n\nCandidate factors from the discovery panel:\n{listing}\n\n\
         Produce the merged, deduplicated factor list."
    )
}

pub fn rating_system() -> String {
    "You are scoring how much each factor matters for the forecasting question. \
     Score every factor on a 0-10 importance scale: 10 means the outcome hinges \
     on it, 0 means irrelevant. Score each factor exactly once, using the factor \
     names verbatim. Respond with JSON only."
        .to_string()
}

pub fn rating_user(question: &str, factors: &[FactorCandidate]) -> String {
    let listing = serde_json::to_string_pretty(factors).unwrap_or_else(|_| "[]".to_string());
    format!("Question: {question}\n\nFactors to score:\n{listing}")
}

pub fn consensus_system() -> String {
    "You are the consensus step after an importance rating round. Review the \
     proposed scores, correct any that look inconsistent with each other, and \
     return the final score for every factor. Use the factor names verbatim. \
     Respond with JSON only."
        .to_string()
}

pub fn consensus_user(
    question: &str,
    factors: &[FactorCandidate],
    ratings: &[FactorRating],
) -> String {
    let factor_listing = serde_json::to_string_pretty(factors).unwrap_or_else(|_| "[]".to_string());
    let rating_listing = serde_json::to_string_pretty(ratings).unwrap_or_else(|_| "[]".to_string());
    format!(
        "Question: {question}\n\nFactors:\n{factor_listing}\n\n\
         Proposed scores from the rating round:\n{rating_listing}\n\n\
         Return the final consensus score per factor."
    )
}

pub fn historical_system() -> String {
    "You are a base-rate researcher. For the factor you are given, analyze \
     historical precedent: how often have comparable situations resolved, what \
     reference classes apply, and what do past analogues suggest about this \
     question. Write a dense evidence summary; avoid speculation about current \
     events. Respond with JSON only."
        .to_string()
}

pub fn current_system() -> String {
    "You are a current-evidence researcher with web search available. For the \
     factor you are given, gather the most recent concrete developments and \
     data points bearing on the question. Cite what you found in the summary \
     text. Respond with JSON only."
        .to_string()
}

pub fn research_user(question: &str, factor_name: &str, factor_description: &str) -> String {
    format!(
        "Question: {question}\n\nFactor under research: {factor_name}\n\
         Description: {factor_description}\n\n\
         Summarize the evidence this factor contributes to the forecast."
    )
}

fn personality(class: ForecasterClass) -> &'static str {
    match class {
        ForecasterClass::Conservative => {
            "Your style is conservative: anchor hard on base rates, discount \
             dramatic narratives, and keep probabilities away from the extremes \
             unless the evidence is overwhelming. When uncertain, report lower \
             confidence rather than a bolder number."
        }
        ForecasterClass::Momentum => {
            "Your style is momentum-driven: weight the direction and pace of \
             recent developments heavily, and assume established trends persist \
             unless something concrete is breaking them."
        }
        ForecasterClass::Historical => {
            "Your style is historical: reference classes and precedent dominate. \
             Map this question onto past analogues and let their resolution \
             frequencies drive your probability."
        }
        ForecasterClass::Realtime => {
            "Your style is real-time: the newest evidence matters most. Reweight \
             aggressively toward the latest developments in the research, even \
             when they cut against longer-run patterns."
        }
        ForecasterClass::Balanced => {
            "Your style is balanced: weigh base rates and current evidence \
             evenly, and let the factor importance scores arbitrate when they \
             disagree."
        }
    }
}

pub fn synthesis_system(class: ForecasterClass) -> String {
    format!(
        "You are a probabilistic forecaster producing a final calibrated \
         estimate for a question, given researched factors. {personality} \
         Output prediction_probability in [0,1] for the YES outcome, a \
         confidence in [0,1] for how much evidence backs the estimate, your \
         reasoning, and the key factors that drove it. Respond with JSON only.",
        personality = personality(class)
    )
}

pub fn synthesis_user(question: &str, factors: &[FactorRow]) -> String {
    let mut body = format!("Question: {question}\n\nResearched factors:\n");
    for factor in factors {
        body.push_str(&format!(
            "\n## {} (importance {:.1})\n{}\n",
            factor.name,
            factor.importance_score.unwrap_or(0.0),
            factor
                .research_summary
                .as_deref()
                .unwrap_or("(no research available)")
        ));
    }
    body.push_str("\nProduce your calibrated forecast.");
    body
}

/// Persona line stored on a trader's state row for observers.
pub fn trader_system_prompt(name: &str, description: &str) -> String {
    format!("{name}: {description}")
}
