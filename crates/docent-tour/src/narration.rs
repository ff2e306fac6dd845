//! Turns a tour stop into the question text handed to the RAG provider
//! (spec.md §4.8: prefetch work is "a normal orchestrator request"). The
//! RAG contract (`docent_providers::RagProvider::ask`) only knows
//! `{question, session_id}`; the tour machine owns the template/style/zone
//! knowledge spec.md's `/tour/start` body carries, so it is the one that
//! renders a stop name down to that single question string.

use docent_core::model::TourState;

/// A deterministic prompt for narrating `stop` under `state`'s
/// zone/profile/template/style. Deliberately plain string interpolation,
/// not a templating engine: the RAG backend is expected to resolve
/// `template_id` against its own knowledge base, this just carries enough
/// context for it to do so.
pub fn question_for_stop(state: &TourState, stop: &str) -> String {
    format!(
        "[tour zone={} profile={} template={} style={} duration_s={}] 讲解展品：{}",
        state.zone, state.profile, state.template_id, state.style, state.duration_s, stop
    )
}

/// The `session_id` a tour narration request is billed against. Kept
/// distinct from an ad-hoc `/ask`'s session id (which the HTTP caller
/// supplies) so RAG backends that scope retrieval context per session can
/// tell tour narration apart from free-form questions.
pub fn tour_session_id(client_id: &str, zone: &str) -> String {
    format!("tour:{client_id}:{zone}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_stop_with_context() {
        let mut state = TourState::idle();
        state.zone = "z1".into();
        state.profile = "adult".into();
        state.template_id = "t1".into();
        state.style = "formal".into();
        let q = question_for_stop(&state, "青铜鼎");
        assert!(q.contains("青铜鼎"));
        assert!(q.contains("z1"));
        assert!(q.contains("adult"));
    }
}
