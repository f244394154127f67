/// Subject and durable-consumer names are derived, never configured
/// directly, so two operators of the same pipeline can never collide and
/// a restarted operator always resumes the same durable consumer
/// (spec.md §6).
pub fn operator_subject(pipeline_id: &str, operator: &str) -> String {
    format!("{pipeline_id}.{operator}")
}

pub fn durable_consumer_name(pipeline_id: &str, operator: &str) -> String {
    format!("{pipeline_id}.{operator}")
}

pub fn ingestor_subject(pipeline_id: &str, topic: &str) -> String {
    operator_subject(pipeline_id, &format!("ingest.{topic}"))
}

pub fn dedup_subject(pipeline_id: &str) -> String {
    operator_subject(pipeline_id, "dedup")
}

pub fn join_subject(pipeline_id: &str) -> String {
    operator_subject(pipeline_id, "join")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subjects_are_namespaced_by_pipeline() {
        assert_eq!(ingestor_subject("p1", "orders"), "p1.ingest.orders");
        assert_eq!(dedup_subject("p1"), "p1.dedup");
    }
}
