//! Client operations against the demo controller.

mod common;

use nurdctrl::model::{
    AccessWidth, HardwareFault, ModuleAccess, ModuleAccessRequest, RegisterScope,
};
use nurdctrl::server::MockController;
use nurdctrl::{CtrlError, ErrorKind, RegisterRequest, RegisterSelection, RegisterTarget};

fn single(target: RegisterTarget, selection: RegisterSelection) -> RegisterRequest {
    RegisterRequest { target, selection }
}

#[tokio::test]
async fn test_ping_reports_controller() {
    let server = common::start(MockController::demo()).await;
    let mut client = common::connect(&server).await;

    let info = client.ping().await.unwrap();
    assert_eq!(info.name, "demo");
    assert_eq!(info.protocol_version, nurdctrl::network::PROTOCOL_VERSION);
    assert_eq!(client.controller(), Some(&info));

    client.close().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_list_crates_is_deterministic() {
    let server = common::start(MockController::demo()).await;
    let mut client = common::connect(&server).await;

    let first = client.list_crates().await.unwrap();
    let labels: Vec<&str> = first.iter().map(|c| c.label.as_str()).collect();
    assert_eq!(labels, vec!["main", "tdc", "scaler"]);
    for _ in 0..5 {
        assert_eq!(client.list_crates().await.unwrap(), first);
    }

    client.close().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_crate_info_for_every_listed_crate() {
    let server = common::start(MockController::demo()).await;
    let mut client = common::connect(&server).await;

    for summary in client.list_crates().await.unwrap() {
        let info = client.crate_info(summary.index).await.unwrap();
        assert_eq!(info.summary(), summary);
    }

    let tdc = client.crate_info(1).await.unwrap();
    assert_eq!(tdc.modules[0].kind, "GSI_TRIDI");
    assert_eq!(tdc.modules[0].submodules.len(), 3);
    assert!(tdc.global_registers.is_empty());

    client.close().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_unknown_crate_is_not_found_and_connection_survives() {
    let server = common::start(MockController::demo()).await;
    let mut client = common::connect(&server).await;

    let err = client.crate_info(99).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(!err.is_retriable());
    assert!(client.is_connected());

    assert_eq!(client.list_crates().await.unwrap().len(), 3);

    client.close().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_hot_unplugged_crate_is_not_found() {
    let mock = MockController::demo();
    let server = common::start(mock.clone()).await;
    let mut client = common::connect(&server).await;

    let before = client.list_crates().await.unwrap();
    assert!(before.iter().any(|c| c.index == 1));

    let removed = mock.remove_crate(1).await.unwrap();
    let err = client.crate_info(1).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let err = client.dump_registers(RegisterTarget::module(1, 0)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    // Re-enumerating shows the new topology.
    let after = client.list_crates().await.unwrap();
    assert_eq!(after.len(), 2);

    mock.insert_crate(removed).await;
    assert_eq!(client.crate_info(1).await.unwrap().label, "tdc");

    client.close().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_register_dump_matches_declared_shapes() {
    let server = common::start(MockController::demo()).await;
    let mut client = common::connect(&server).await;

    let info = client.crate_info(0).await.unwrap();
    for module in &info.modules {
        let dump = client
            .dump_registers(RegisterTarget::module(0, module.index))
            .await
            .unwrap();
        let names: Vec<&str> = dump.names().collect();
        let declared: Vec<&str> = module.registers.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, declared);
        for (reading, shape) in dump.readings.iter().zip(&module.registers) {
            assert_eq!(reading.offset, shape.offset);
            assert_eq!(reading.values.len(), shape.element_count());
            assert!(reading.values.iter().all(|v| v & !shape.mask() == 0));
        }
    }

    let globals = client.dump_registers(RegisterTarget::global(0)).await.unwrap();
    let names: Vec<&str> = globals.names().collect();
    assert_eq!(names, vec!["trigger_mask", "dead_time"]);

    client.close().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_single_register_by_name_and_offset() {
    let server = common::start(MockController::demo()).await;
    let mut client = common::connect(&server).await;

    let by_name = client
        .read_registers(&single(
            RegisterTarget::module(0, 0),
            RegisterSelection::Named("FIRMWARE".into()),
        ))
        .await
        .unwrap();
    assert_eq!(by_name.len(), 1);
    assert_eq!(by_name.get("firmware").unwrap().value(), Some(0x0a05));

    let by_offset = client
        .read_registers(&single(RegisterTarget::module(0, 1), "0x1000".parse().unwrap()))
        .await
        .unwrap();
    assert_eq!(by_offset.get("firmware").unwrap().value(), Some(0x0104));

    let sub = client
        .read_registers(&single(
            RegisterTarget {
                crate_index: 1,
                scope: "0.2".parse().unwrap(),
            },
            RegisterSelection::Named("threshold".into()),
        ))
        .await
        .unwrap();
    assert_eq!(sub.get("threshold").unwrap().values.len(), 16);

    client.close().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_unknown_register_is_register_error() {
    let server = common::start(MockController::demo()).await;
    let mut client = common::connect(&server).await;

    let err = client
        .read_registers(&single(
            RegisterTarget::module(0, 0),
            RegisterSelection::Named("BADREG".into()),
        ))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Register);
    assert_ne!(err.kind(), ErrorKind::Hardware);

    let err = client
        .read_registers(&single(RegisterTarget::module(0, 0), RegisterSelection::Offset(0x7ffe)))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Register);

    // Unknown module and unknown sub-module are lookups, not register errors.
    let err = client.dump_registers(RegisterTarget::module(0, 9)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    let err = client
        .dump_registers(RegisterTarget {
            crate_index: 1,
            scope: RegisterScope::Module {
                index: 0,
                submodule: Some(7),
            },
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    assert!(client.is_connected());
    client.close().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_hardware_faults_are_distinguished() {
    let mock = MockController::demo();
    let server = common::start(mock.clone()).await;
    let mut client = common::connect(&server).await;
    let target = RegisterTarget::module(0, 1);

    mock.inject_fault(0, target.scope, "status", HardwareFault::BusTimeout)
        .await;
    let err = client.dump_registers(target).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Hardware);
    assert!(err.is_retriable());
    assert!(err.to_string().contains("bus timeout"));
    assert!(client.is_connected());

    // Other registers of the module still read fine.
    let firmware = client
        .read_registers(&single(target, RegisterSelection::Named("firmware".into())))
        .await
        .unwrap();
    assert_eq!(firmware.len(), 1);

    mock.inject_fault(0, target.scope, "status", HardwareFault::AccessViolation)
        .await;
    let err = client.dump_registers(target).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Hardware);
    assert!(!err.is_retriable());

    mock.clear_faults().await;
    assert_eq!(client.dump_registers(target).await.unwrap().len(), 4);

    client.close().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_module_access_reads_are_live() {
    let mock = MockController::demo();
    let server = common::start(mock.clone()).await;
    let mut client = common::connect(&server).await;

    let target = RegisterTarget::module(2, 0);
    let request = ModuleAccessRequest {
        target,
        accesses: vec![
            ModuleAccess::write(0x1108, AccessWidth::Bits16, 0x1ff),
            ModuleAccess::read(0x1108, AccessWidth::Bits16),
            ModuleAccess::read(0x1004, AccessWidth::Bits32),
        ],
    };
    let values = client.module_access(&request).await.unwrap();
    assert_eq!(values.len(), 2);
    assert_eq!(values[0], 0x1ff);
    assert_eq!(
        mock.register_value(2, target.scope, 0x1108).await,
        Some(0x1ff)
    );

    // A register read afterwards sees the written value, nothing is cached.
    let control = client
        .read_registers(&single(target, RegisterSelection::Named("control".into())))
        .await
        .unwrap();
    assert_eq!(control.get("control").unwrap().value(), Some(0x1ff));

    // Array elements are addressable at their stride; width must match.
    let threshold = ModuleAccessRequest {
        target: RegisterTarget::module(0, 0),
        accesses: vec![
            ModuleAccess::write(0x1082, AccessWidth::Bits16, 0xffff),
            "0x1082:16".parse().unwrap(),
        ],
    };
    assert_eq!(client.module_access(&threshold).await.unwrap(), vec![0x1ff]);

    let wrong_width = ModuleAccessRequest {
        target: RegisterTarget::module(0, 0),
        accesses: vec![ModuleAccess::read(0x1000, AccessWidth::Bits32)],
    };
    let err = client.module_access(&wrong_width).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Register);

    client.close().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_oversize_arguments_are_refused_locally() {
    let mock = MockController::demo();
    let server = common::start(mock.clone()).await;
    let mut client = common::connect(&server).await;
    let before = mock.request_count();

    let request = ModuleAccessRequest {
        target: RegisterTarget::module(2, 0),
        accesses: vec![ModuleAccess::read(0x1108, AccessWidth::Bits16); 70_000],
    };
    let err = client.module_access(&request).await.unwrap_err();
    assert!(matches!(err, CtrlError::Encode(_)));
    assert_eq!(err.kind(), ErrorKind::Usage);
    assert_eq!(mock.request_count(), before);

    // Nothing was sent, so the connection is still good.
    assert!(client.is_connected());
    assert_eq!(client.list_crates().await.unwrap().len(), 3);

    client.close().await;
    server.shutdown().await;
}
