use crate::model::EvaluationUnit;
use crate::retrieval::TargetContext;
use crate::targets::{TargetId, TargetSet};
use std::fmt::Write;

pub const EVALUATION_SYSTEM_PROMPT: &str = "\
You are a clinical documentation integrity reviewer. You compare a numbered \
medical chart against the coverage guidelines of one or more policy \
authorities and decide, for each authority independently, whether the chart \
documents every element that authority requires for the procedure under \
review.

Ground rules:
- Judge each authority ONLY against the guideline excerpts supplied for it. \
Never carry a requirement from one authority to another.
- A requirement is met only when the chart states it. Do not infer \
undocumented facts.
- Cite chart lines with their L### references. Ranges use the form L012-L015.
- Be specific about what is missing and how the author could document it.
- Answer with strict JSON only: no prose, no code fences.";

pub const EXTRACTION_SYSTEM_PROMPT: &str = "\
You are a medical coding specialist. You read operative reports and charts \
and list the procedures performed together with any billing codes that the \
chart states for each procedure. Answer with strict JSON only.";

/// Combined request asking for every target in `contexts` at once.
///
/// `contexts` is iterated in the given order, which callers keep in target
/// priority order so identical inputs always produce identical prompts.
pub fn evaluation_prompt(
    unit: &EvaluationUnit,
    numbered_chart: &str,
    targets: &TargetSet,
    contexts: &[(&TargetId, &TargetContext)],
) -> String {
    let mut p = String::new();
    p.push_str("Return STRICT JSON ONLY, one key per authority, using exactly these keys:\n{\n");
    for (i, (id, _)) in contexts.iter().enumerate() {
        let comma = if i + 1 < contexts.len() { "," } else { "" };
        let _ = writeln!(
            p,
            "  \"{}\": {{ ...evaluation for {}... }}{}",
            id,
            targets.display_name(id),
            comma
        );
    }
    p.push_str("}\n\nEach evaluation object has this shape:\n");
    p.push_str(
        "{\n\
         \x20 \"procedure_evaluated\": \"STRING\",\n\
         \x20 \"policy_name\": \"STRING (policy being applied)\",\n\
         \x20 \"decision\": \"Sufficient | Insufficient\",\n\
         \x20 \"primary_reasons\": [\"STRING\"],\n\
         \x20 \"requirement_checklist\": [{\n\
         \x20   \"requirement_id\": \"STRING\",\n\
         \x20   \"status\": \"met | unmet | unclear\",\n\
         \x20   \"evidence\": [{\"line_reference\": \"L012\"}],\n\
         \x20   \"missing_to_meet\": \"STRING\",\n\
         \x20   \"suggestion\": \"STRING\"\n\
         \x20 }],\n\
         \x20 \"coding_implications\": {\"eligible_codes_if_sufficient\": [\"STRING\"], \"notes\": \"STRING\"},\n\
         \x20 \"improvement_recommendations\": {\"documentation_gaps\": [\"STRING\"], \"compliance_actions\": [\"STRING\"], \"priority\": \"high | medium | low\"}\n\
         }\n\n",
    );

    let _ = writeln!(p, "Procedure under review: {}", unit.name);
    if !unit.codes.is_empty() {
        let _ = writeln!(p, "Codes billed for this procedure: {}", unit.codes.join(", "));
    }
    if !unit.evidence.trim().is_empty() {
        let _ = writeln!(p, "Extracted evidence: {}", unit.evidence.trim());
    }
    p.push_str(
        "\nRules:\n\
         - decision is Sufficient only if ALL required elements in that authority's guidelines are evidenced.\n\
         - decision is Insufficient if ANY required element is missing or contradicted.\n\
         - requirement_checklist covers every requirement in that authority's guidelines.\n\n",
    );

    let _ = writeln!(p, "Medical chart with line numbers:\n{}\n", numbered_chart);

    for (id, ctx) in contexts {
        let name = targets.display_name(id).to_uppercase();
        let basis = if ctx.code_based && !unit.codes.is_empty() {
            format!("CODES {}", unit.codes.join(", "))
        } else {
            format!("PROCEDURE '{}'", unit.name)
        };
        let _ = write!(
            p,
            "=== {} GUIDELINES FOR {} ===\n{}\n=== END OF {} GUIDELINES ===\n\n",
            name, basis, ctx.text, name
        );
    }
    p
}

/// Asks for patient details and procedures with explicitly linked codes.
pub fn extraction_prompt(numbered_chart: &str) -> String {
    format!(
        "Return STRICT JSON ONLY with these keys:\n\
         {{\n\
         \x20 \"patient_name\": \"STRING or null\",\n\
         \x20 \"patient_age\": \"STRING or null\",\n\
         \x20 \"chart_specialty\": \"STRING or null\",\n\
         \x20 \"procedures\": [{{\"name\": \"STRING\", \"codes\": [\"STRING\"], \"evidence\": \"L### references\"}}],\n\
         \x20 \"summary\": \"STRING (2-4 sentences)\"\n\
         }}\n\n\
         List each distinct procedure performed. Put a billing code under a procedure only when \
         the chart ties that code to it; leave \"codes\" empty otherwise.\n\n\
         Medical chart with line numbers:\n{}\n",
        numbered_chart
    )
}
