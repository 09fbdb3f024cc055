pub mod tests {
    use serde_json::json;

    use crate::{
        derive,
        ContainerHandle,
        ContainerIdentifier,
        ContainerPurpose,
        ContainerRecord,
        ContainerRecordBuilder,
        ContainerScope,
        ContainerState,
    };

    pub const TEST_PIPELINE_ID: u64 = 1;
    pub const TEST_BUILD_ID: u64 = 7;
    pub const TEST_PLAN_ID: &str = "plan-1";
    pub const TEST_WORKER: &str = "test_worker_1";

    pub fn mock_build_scope() -> ContainerScope {
        ContainerScope::for_build(TEST_PIPELINE_ID, TEST_BUILD_ID, TEST_PLAN_ID)
    }

    pub fn mock_build_identifier(step_name: &str) -> ContainerIdentifier {
        derive(
            &mock_build_scope(),
            step_name,
            ContainerPurpose::Task,
            &json!({"image": "busybox", "run": {"path": "make", "args": [step_name]}}),
        )
        .unwrap()
    }

    pub fn mock_check_identifier(resource_id: u64) -> ContainerIdentifier {
        derive(
            &ContainerScope::for_check(TEST_PIPELINE_ID, resource_id),
            "check",
            ContainerPurpose::Check,
            &json!({"type": "git", "source": {"uri": "https://example.com/repo.git"}}),
        )
        .unwrap()
    }

    pub fn mock_record(
        handle: &str,
        identifier: &ContainerIdentifier,
        state: ContainerState,
        created_at: u64,
        last_used_at: u64,
    ) -> ContainerRecord {
        let mut record = ContainerRecord::creating(
            ContainerHandle::from(handle),
            identifier.clone(),
            TEST_WORKER,
            created_at,
        );
        record.state = state;
        record.last_used_at = last_used_at;
        record
    }

    pub fn mock_record_on_worker(
        identifier: &ContainerIdentifier,
        worker_name: &str,
        state: ContainerState,
        now: u64,
    ) -> ContainerRecord {
        ContainerRecordBuilder::default()
            .identifier(identifier.clone())
            .worker_name(worker_name.to_string())
            .state(state)
            .created_at(now)
            .last_used_at(now)
            .build_id(identifier.scope.build_id)
            .pipeline_id(Some(identifier.scope.pipeline_id))
            .build()
            .unwrap()
    }
}
