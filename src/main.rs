use anyhow::{anyhow, bail, Result};
use dbus_remote::{
    bus::BusConnection,
    introspect::{MemberKind, MethodTag},
    value::{argument_to_string, ObjectPath, Signature},
    AbstractInterface, Connection, EventQueue, InterfaceKind, Message, MessageType, Value,
};
use log::{info, warn};
use std::{sync::Arc, time::Duration};
use structopt::StructOpt;
use tokio::{signal, task, time};

#[derive(StructOpt, Debug)]
struct Params {
    #[structopt(long = "system", help = "use the system bus instead of the session bus")]
    system: bool,
    #[structopt(long = "timeout", help = "call timeout (milliseconds)")]
    timeout: Option<u64>,
    #[structopt(subcommand)]
    cmd: Cmd,
}

#[derive(StructOpt, Debug)]
struct Target {
    #[structopt(help = "the service to talk to")]
    service: String,
    #[structopt(help = "the object path")]
    path: String,
    #[structopt(help = "the interface, empty for any")]
    interface: String,
}

#[derive(StructOpt, Debug)]
enum Cmd {
    #[structopt(name = "call", about = "call a method and print the reply")]
    Call {
        #[structopt(flatten)]
        target: Target,
        method: String,
        #[structopt(help = "arguments as type:value, e.g. s:hello i:42 b:true")]
        args: Vec<String>,
    },
    #[structopt(name = "introspect", about = "print the method table of an interface")]
    Introspect {
        service: String,
        path: String,
        #[structopt(help = "the interface, all interfaces merged if omitted")]
        interface: Option<String>,
    },
    #[structopt(name = "get", about = "read a property")]
    Get {
        #[structopt(flatten)]
        target: Target,
        property: String,
    },
    #[structopt(name = "set", about = "write a property")]
    Set {
        #[structopt(flatten)]
        target: Target,
        property: String,
        #[structopt(help = "the value as type:value")]
        value: String,
    },
    #[structopt(name = "watch", about = "print emissions of a signal until interrupted")]
    Watch {
        #[structopt(flatten)]
        target: Target,
        signal: String,
    },
}

fn parse_arg(s: &str) -> Result<Value> {
    let (typ, v) = s
        .split_once(':')
        .ok_or_else(|| anyhow!("expected type:value, got {}", s))?;
    Ok(match typ {
        "y" => Value::Byte(v.parse()?),
        "b" => Value::Bool(v.parse()?),
        "n" => Value::Int16(v.parse()?),
        "q" => Value::UInt16(v.parse()?),
        "i" => Value::Int32(v.parse()?),
        "u" => Value::UInt32(v.parse()?),
        "x" => Value::Int64(v.parse()?),
        "t" => Value::UInt64(v.parse()?),
        "d" => Value::Double(v.parse()?),
        "s" => Value::Str(v.to_string()),
        "o" => Value::ObjectPath(
            ObjectPath::new(v).ok_or_else(|| anyhow!("invalid object path {}", v))?,
        ),
        "g" => Value::Signature(
            Signature::new(v).ok_or_else(|| anyhow!("invalid signature {}", v))?,
        ),
        "v" => Value::variant(parse_arg(v)?),
        typ => bail!("unsupported argument type {}", typ),
    })
}

fn print_reply(reply: &Message) -> Result<()> {
    match reply.kind() {
        MessageType::Reply => {
            for a in reply.arguments() {
                if *a != Value::Empty {
                    println!("{}", argument_to_string(a));
                }
            }
            Ok(())
        }
        MessageType::Error => bail!("{}", dbus_remote::Error::from(reply)),
        _ => Ok(()),
    }
}

fn print_table(iface: &AbstractInterface) -> Result<()> {
    let table = task::block_in_place(|| iface.load_method_table())?;
    println!("interface {}", table.interface());
    for p in table.properties() {
        let access = match (p.readable, p.writable) {
            (true, true) => "readwrite",
            (true, false) => "read",
            (false, true) => "write",
            (false, false) => "none",
        };
        println!("  property {} {} ({})", p.signature, p.name, access);
    }
    for m in table.members() {
        let kind = match m.kind {
            MemberKind::Method => "method",
            MemberKind::Signal => "signal",
        };
        let tag = match m.tag {
            MethodTag::NoReply => " [noreply]",
            MethodTag::None => "",
        };
        let ret = if m.return_type.is_empty() { "void" } else { &*m.return_type };
        println!("  {} {} {}{}", kind, ret, m.prototype, tag);
    }
    Ok(())
}

fn open(conn: &Arc<dyn Connection>, target: &Target) -> Result<AbstractInterface> {
    let iface = task::block_in_place(|| {
        AbstractInterface::new(
            conn.clone(),
            &target.service,
            &target.path,
            &target.interface,
            InterfaceKind::Dynamic,
        )
    });
    if !iface.is_valid() {
        bail!("{}", iface.last_error())
    }
    Ok(iface)
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let opts = Params::from_args();
    let bus = task::block_in_place(|| {
        if opts.system {
            BusConnection::system()
        } else {
            BusConnection::session()
        }
    })?;
    info!("connected as {}", bus.unique_name());
    let conn: Arc<dyn Connection> = Arc::new(bus);
    let timeout = opts.timeout.map(Duration::from_millis);
    match opts.cmd {
        Cmd::Call {
            target,
            method,
            args,
        } => {
            let iface = open(&conn, &target)?;
            iface.set_timeout(timeout);
            let args = args.iter().map(|a| parse_arg(a)).collect::<Result<Vec<_>>>()?;
            let reply = iface.async_call(&method, args).await;
            print_reply(&reply)?
        }
        Cmd::Introspect {
            service,
            path,
            interface,
        } => {
            let target = Target {
                service,
                path,
                interface: interface.unwrap_or_default(),
            };
            let iface = open(&conn, &target)?;
            iface.set_timeout(timeout);
            print_table(&iface)?
        }
        Cmd::Get { target, property } => {
            let iface = open(&conn, &target)?;
            iface.set_timeout(timeout);
            let v = task::block_in_place(|| iface.property_value(&property))?;
            println!("{}", argument_to_string(&v))
        }
        Cmd::Set {
            target,
            property,
            value,
        } => {
            let iface = open(&conn, &target)?;
            iface.set_timeout(timeout);
            let value = parse_arg(&value)?;
            task::block_in_place(|| iface.set_property_value(&property, value))?
        }
        Cmd::Watch { target, signal: member } => {
            let iface = open(&conn, &target)?;
            let connected = iface.connect_signal(&member, |msg: &Message| {
                let args = msg
                    .arguments()
                    .iter()
                    .map(argument_to_string)
                    .collect::<Vec<_>>()
                    .join(", ");
                println!("{}.{}({})", msg.interface(), msg.member(), args)
            });
            if connected.is_none() {
                bail!("cannot watch {}", member)
            }
            let mut tick = time::interval(Duration::from_millis(50));
            let mut present = true;
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        EventQueue::process_events();
                        if present != iface.is_valid() {
                            present = !present;
                            if present {
                                info!("{} is back as {}", iface.service(), iface.current_owner());
                            } else {
                                warn!("{} went away", iface.service());
                            }
                        }
                    },
                    r = signal::ctrl_c() => break r?,
                }
            }
        }
    }
    Ok(())
}
