#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use anyhow::Result;
    use data_model::test_objects::tests::{mock_build_identifier, TEST_WORKER};
    use opentelemetry_sdk::metrics::{InMemoryMetricExporter, PeriodicReader, SdkMeterProvider};

    use crate::{config::ServerConfig, registry::CallContext, service::Service};

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_components_report_to_installed_meter_provider() -> Result<()> {
        let exporter = InMemoryMetricExporter::default();
        let provider = SdkMeterProvider::builder()
            .with_reader(PeriodicReader::builder(exporter.clone()).build())
            .build();
        let temp_dir = tempfile::tempdir()?;
        let config = ServerConfig {
            state_store_path: temp_dir.path().join("state").to_string_lossy().to_string(),
            ..Default::default()
        };

        let service = Service::with_meter_provider(config, Some(provider.clone())).await?;
        service
            .registry
            .reserve(
                &CallContext::default(),
                &mock_build_identifier("compile"),
                TEST_WORKER,
            )
            .await?;
        service.reaper.run_once().await?;
        provider.force_flush()?;

        let exported = exporter.get_finished_metrics().unwrap();
        let names: HashSet<String> = exported
            .iter()
            .flat_map(|resource| resource.scope_metrics())
            .flat_map(|scope| scope.metrics())
            .map(|metric| metric.name().to_string())
            .collect();
        for name in [
            "registry.reservations",
            "registry.reaper_passes",
            "registry.state_store_write_duration",
        ] {
            assert!(names.contains(name), "{} not exported: {:?}", name, names);
        }
        Ok(())
    }
}
