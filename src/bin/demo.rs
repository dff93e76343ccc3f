//! Voltage Serial Demo
//!
//! Shows the offline parts of the engine (value formats, register binding,
//! range building) and then polls a Modbus RTU slave behind a TCP serial
//! gateway.
//!
//! Usage: cargo run --features demo --bin demo [gateway_address] [slave_id]
//! Example: cargo run --features demo --bin demo 127.0.0.1:4001 1
//!
//! Set `RUST_LOG=voltage_serial::frames=debug` to see the wire traffic.

use std::time::Duration;

use voltage_serial::{
    bind, encode, split_register_list, DeviceConfig, DeviceId, DeviceLimits, PortConfig,
    ProtocolRegistry, RangeCandidate, RegisterConfig, RegisterId, RegisterKind, Scaling,
    SerialClient, TcpPort, ValueFormat, WordOrder,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    voltage_serial::logging::init("info");

    println!("{}", voltage_serial::info());
    println!("=====================================\n");

    // =========================================================================
    // Part 1: Value formats
    // =========================================================================
    println!("Part 1: Value formats");
    println!("---------------------");

    let samples = [
        (0x0000_FF38, ValueFormat::S16, Scaling::new(0.1)),
        (0x4248_0000, ValueFormat::Float, Scaling::default()),
        (0x0012_3456, ValueFormat::Bcd24, Scaling::default()),
        (0x00FF_D8F0, ValueFormat::S24, Scaling::default()),
    ];
    for (raw, format, scaling) in samples {
        println!("  {:>8} {:#010X} -> {}", format.to_string(), raw, encode(raw, format, &scaling));
    }

    // =========================================================================
    // Part 2: Register binding
    // =========================================================================
    println!("\nPart 2: Register binding");
    println!("------------------------");

    for order in [WordOrder::BigEndian, WordOrder::LittleEndian] {
        let layout = bind(32, 0, 32, 16, order)?;
        let offsets: Vec<u32> = layout.iter().map(|b| b.address_offset).collect();
        println!("  U32 over 16-bit registers, {:?}: address offsets {:?}", order, offsets);
    }

    // =========================================================================
    // Part 3: Range building
    // =========================================================================
    println!("\nPart 3: Range building");
    println!("----------------------");

    let candidates: Vec<RangeCandidate> = [0u32, 1, 2, 10, 11, 40]
        .into_iter()
        .map(|address| RangeCandidate {
            register: RegisterId(address),
            kind: RegisterKind::HOLDING,
            address,
            poll_interval: Duration::from_secs(1),
        })
        .collect();
    for hole in [0, 8, 40] {
        let limits = DeviceLimits::new().with_max_reg_hole(hole);
        let ranges = split_register_list(DeviceId(0), candidates.clone(), &limits);
        let spans: Vec<String> = ranges.iter().map(|r| r.to_string()).collect();
        println!("  max hole {:>2}: {}", hole, spans.join(", "));
    }

    // =========================================================================
    // Part 4: Polling through a TCP gateway
    // =========================================================================
    println!("\nPart 4: Polling");
    println!("---------------");

    let mut args = std::env::args().skip(1);
    let address = args.next().unwrap_or_else(|| "127.0.0.1:4001".to_string());
    let slave_id: u8 = args.next().and_then(|s| s.parse().ok()).unwrap_or(1);

    let config = PortConfig::new()
        .with_response_timeout(Duration::from_millis(300))
        .with_device(
            DeviceConfig::new("demo", slave_id, "modbus")
                .with_max_reg_hole(4)
                .with_register(
                    RegisterConfig::new("voltage", "holding", 0)
                        .with_scale(0.1)
                        .with_poll_interval(Duration::from_secs(1)),
                )
                .with_register(
                    RegisterConfig::new("energy", "holding", 2)
                        .with_format(ValueFormat::U32)
                        .with_poll_interval(Duration::from_secs(1)),
                )
                .with_register(RegisterConfig::new("relay", "coil", 0)),
        );

    let registry = ProtocolRegistry::with_builtin();
    let port = TcpPort::new(address.clone()).with_connect_timeout(Duration::from_secs(2));
    let mut client = SerialClient::new(port, &config, &registry);
    client.on_value(|channel, value| println!("  {:<8} = {}", channel.name(), value));
    client.on_error(|channel, state| println!("  {:<8} ! {:?}", channel.name(), state));

    println!("  Polling slave {} via {} for 5 seconds...", slave_id, address);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if let Err(e) = client.cycle().await {
            println!("  Port unavailable: {}", e);
            println!("  (This is expected if no gateway is listening)");
            break;
        }
    }

    let stats = client.stats();
    println!("\n  Cycles: {}, ranges read: {}, range errors: {}", stats.cycles, stats.ranges_read, stats.range_errors);

    client.close().await?;
    println!("\nDemo completed!");
    Ok(())
}
