//! The `simulate` command end to end over in-memory links

use blehome_cli::{run_simulation, AppConfig, CliError, Topology};
use blehome_core::{DeviceState, MeasurementKind, MeshAddress};

#[tokio::test(start_paused = true)]
async fn test_chain_simulation_reaches_every_device() {
    let config = AppConfig::default();
    let report = run_simulation(&config, Topology::Chain, 3).await.unwrap();

    assert_eq!(
        report.devices,
        vec![MeshAddress::new(2), MeshAddress::new(3), MeshAddress::new(4)]
    );
    assert_eq!(report.control.destination, MeshAddress::new(4));
    assert_eq!(report.control.state, Some(DeviceState::new(true, 80)));

    let known: Vec<MeshAddress> = report.registry.iter().map(|record| record.address).collect();
    for device in &report.devices {
        assert!(known.contains(device), "{} missing from registry", device);
    }

    let reading = report.reading.expect("bridged reading");
    assert_eq!(reading.bridge, MeshAddress::new(4));
    let temperature = reading.value(MeasurementKind::Temperature).unwrap();
    assert!((temperature - 20.1).abs() < 1e-9);

    assert_eq!(report.stats.commands.timed_out, 0);
}

#[tokio::test(start_paused = true)]
async fn test_star_simulation_needs_no_relaying_for_control() {
    let config = AppConfig::default();
    let report = run_simulation(&config, Topology::Star, 2).await.unwrap();

    assert_eq!(report.control.destination, MeshAddress::new(3));
    assert_eq!(report.control.attempts, 1);
    assert!(report.reading.is_some());
}

#[tokio::test]
async fn test_simulation_rejects_address_overflow() {
    let mut config = AppConfig::default();
    config.mesh.address = MeshAddress::new(0xFFF0);
    config.mesh.gateway = MeshAddress::new(0xFFF0);
    let result = run_simulation(&config, Topology::Star, 64).await;
    assert!(matches!(result, Err(CliError::InvalidArgument(_))));
}
