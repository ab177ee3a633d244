//! Built-in step definitions: prompt templates and fallback payloads.

use serde_json::{json, Value};

use super::{context_block, output_schema, pretty, StepDefinition, StepRegistry, StepType};
use crate::context::PipelineContext;

const SYSTEM_PROMPT: &str = "You are a senior business analyst on an AI delivery team. \
Produce concrete, actionable output grounded in the supplied context. \
Never invent data the input does not support. Always answer with a single JSON object.";

/// Register every built-in step.
pub fn register_all(registry: &mut StepRegistry) {
    registry.register(StepType::RequirementsGeneration, requirements_generation());
    registry.register(StepType::TaskGeneration, task_generation());
    registry.register(StepType::QualityValidation, quality_validation());
    registry.register(StepType::ContentEnhancement, content_enhancement());
    registry.register(StepType::SimilarityMatching, similarity_matching());
    registry.register(StepType::FakeContentDetection, fake_content_detection());
    registry.register(StepType::GoalDecomposition, goal_decomposition());
    registry.register(StepType::AssetExtraction, asset_extraction());
    registry.register(StepType::DeliverableAssembly, deliverable_assembly());
}

/// Prompt builder embedding instructions, business context, input and the output schema.
fn templated(
    step: StepType,
    instructions: &'static str,
) -> impl Fn(&Value, &PipelineContext) -> String + Send + Sync + 'static {
    let schema = output_schema(&step).map(|s| pretty(&s)).unwrap_or_default();
    move |input, ctx| {
        let context = context_block(ctx);
        let mut prompt = String::with_capacity(instructions.len() + schema.len() + 256);
        prompt.push_str(instructions);
        if !context.is_empty() {
            prompt.push_str("\n\nBusiness context:\n");
            prompt.push_str(&context);
        }
        prompt.push_str("\n\nInput:\n");
        prompt.push_str(&pretty(input));
        prompt.push_str("\n\nRespond with a JSON object matching this schema:\n");
        prompt.push_str(&schema);
        prompt
    }
}

fn text_field<'a>(input: &'a Value, key: &str) -> Option<&'a str> {
    input.get(key).and_then(Value::as_str).filter(|s| !s.trim().is_empty())
}

pub fn requirements_generation() -> StepDefinition {
    StepDefinition::new(
        SYSTEM_PROMPT,
        templated(
            StepType::RequirementsGeneration,
            "Derive the concrete deliverable requirements needed to achieve the goal below. \
             Each requirement needs a title, a description, a priority (high, medium or low) \
             and measurable acceptance criteria.",
        ),
        |input| {
            let goal = text_field(input, "goal").unwrap_or("the stated goal");
            json!({
                "requirements": [{
                    "title": "Clarify requirements",
                    "description": format!("Requirements for {} need to be defined with the team.", goal),
                    "priority": "high",
                    "acceptance_criteria": ["Stakeholders agree on a written list of deliverables"]
                }],
                "summary": "Requirements needed: automatic generation was unavailable."
            })
        },
    )
    .with_temperature(0.2)
}

pub fn task_generation() -> StepDefinition {
    StepDefinition::new(
        SYSTEM_PROMPT,
        templated(
            StepType::TaskGeneration,
            "Break the requirement below into executable tasks for a small team. \
             Order tasks so dependencies come first and name the role best suited to each.",
        ),
        |input| {
            let requirement = text_field(input, "requirement").unwrap_or("the requirement");
            json!({
                "tasks": [{
                    "name": "Plan work",
                    "description": format!("Manually break down {} into tasks.", requirement),
                    "priority": "high",
                    "dependencies": []
                }]
            })
        },
    )
}

pub fn quality_validation() -> StepDefinition {
    StepDefinition::new(
        SYSTEM_PROMPT,
        templated(
            StepType::QualityValidation,
            "Assess the content below as a business deliverable. Score it from 0.0 to 1.0 for \
             completeness, specificity and actionability, set `passed` when it is ready for a \
             client, and list concrete issues and recommendations.",
        ),
        |_| {
            json!({
                "score": 0.5,
                "passed": false,
                "issues": ["Automatic quality validation unavailable"],
                "recommendations": ["Request a manual review"]
            })
        },
    )
    .with_temperature(0.1)
    .with_fallback_reasoning("Quality could not be assessed; flagged for manual review")
}

pub fn content_enhancement() -> StepDefinition {
    StepDefinition::new(
        SYSTEM_PROMPT,
        templated(
            StepType::ContentEnhancement,
            "Improve the content below: replace placeholders with specific, realistic detail \
             consistent with the context, tighten wording and keep the original structure. \
             List each change you made.",
        ),
        |input| {
            let content = text_field(input, "content").unwrap_or_default();
            json!({ "content": content, "changes": [] })
        },
    )
    .with_temperature(0.5)
}

pub fn similarity_matching() -> StepDefinition {
    StepDefinition::new(
        SYSTEM_PROMPT,
        templated(
            StepType::SimilarityMatching,
            "Compare the subject with each candidate and score semantic similarity from 0.0 to \
             1.0. Return only candidates scoring above 0.3, best first, with a one-line rationale.",
        ),
        |_| json!({ "matches": [] }),
    )
    .with_temperature(0.0)
}

pub fn fake_content_detection() -> StepDefinition {
    StepDefinition::new(
        SYSTEM_PROMPT,
        templated(
            StepType::FakeContentDetection,
            "Decide whether the content below is placeholder, template or fabricated content \
             (lorem ipsum, example.com addresses, generic names, TODO markers, invented metrics). \
             Give a fake_score from 0.0 to 1.0 and list the indicators you found.",
        ),
        |_| {
            json!({
                "is_fake": false,
                "fake_score": 0.0,
                "indicators": ["Detection unavailable; content not inspected"]
            })
        },
    )
    .with_temperature(0.0)
}

pub fn goal_decomposition() -> StepDefinition {
    StepDefinition::new(
        SYSTEM_PROMPT,
        templated(
            StepType::GoalDecomposition,
            "Decompose the business goal below into three to six measurable sub-goals. \
             Give each a metric and a numeric target where the goal implies one.",
        ),
        |input| {
            let goal = text_field(input, "goal").unwrap_or("Achieve the goal");
            json!({
                "sub_goals": [{
                    "title": goal,
                    "description": "Goal kept whole: automatic decomposition was unavailable."
                }]
            })
        },
    )
}

pub fn asset_extraction() -> StepDefinition {
    StepDefinition::new(
        SYSTEM_PROMPT,
        templated(
            StepType::AssetExtraction,
            "Extract reusable business assets (documents, lists, templates, datasets, contact \
             lists, scripts) from the task output below. Name each asset, give its type and \
             copy its content verbatim as structured JSON.",
        ),
        |_| json!({ "assets": [] }),
    )
    .with_max_tokens(4000)
}

pub fn deliverable_assembly() -> StepDefinition {
    StepDefinition::new(
        SYSTEM_PROMPT,
        templated(
            StepType::DeliverableAssembly,
            "Assemble the assets below into one client-ready deliverable with a title, an \
             executive summary and sections. Use the assets' actual content, not descriptions of it.",
        ),
        |input| {
            let title = text_field(input, "goal").unwrap_or("Project deliverable");
            json!({
                "title": title,
                "executive_summary": "Deliverable pending: automatic assembly was unavailable.",
                "sections": []
            })
        },
    )
    .with_max_tokens(4000)
}
