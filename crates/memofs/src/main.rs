//! Interactive shell over an in-memory filesystem served by vfserve.
//!
//! Every command crosses the full dispatch stack: the shell talks to the
//! tree exclusively through a client channel, exactly as an external
//! process would.

use std::collections::HashMap;
use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};

use memofs::{demo_root, MemDir, MemFile};
use vfserve::client::Client;
use vfserve::remote::RemoteHandle;
use vfserve::transport::channel;
use vfserve::watcher::{decode_watch_events, WatchMask};
use vfserve::{
    Event, OpenFlags, Payload, Result, Rights, SetAttrMask, Status, Vfs, Vnode,
};

#[derive(Debug, Parser)]
struct Cli {
    /// Serve the tree read-only.
    #[arg(long)]
    readonly: bool,
}

struct Shell {
    vfs: Arc<Vfs>,
    root_dir: Arc<MemDir>,
    root: Client,
    /// Mount points installed by the `mount` command, so `umount` can
    /// uninstall them and tear the mounted filesystem down.
    mounts: HashMap<String, (Arc<dyn Vnode>, Arc<Vfs>)>,
}

fn split_parent(path: &str) -> (String, String) {
    match path.rsplit_once('/') {
        Some((parent, name)) => (parent.to_owned(), name.to_owned()),
        None => (".".to_owned(), path.to_owned()),
    }
}

impl Shell {
    fn rights(&self) -> Rights {
        Rights::all()
    }

    fn open_dir(&self, path: &str) -> Result<Client> {
        self.root.open(OpenFlags::DIRECTORY, self.rights(), path)
    }

    async fn ls(&self, path: &str) -> Result<()> {
        let dir = self.open_dir(path)?;
        loop {
            let entries = dir.readdir(8192).await?;
            if entries.is_empty() {
                break;
            }
            for entry in entries {
                println!("{:>8}  {:?}  {}", entry.ino, entry.kind, entry.name);
            }
        }
        Ok(())
    }

    async fn cat(&self, path: &str) -> Result<()> {
        let file = self.root.open(OpenFlags::empty(), Rights::READ, path)?;
        let mut total = 0usize;
        loop {
            let chunk = file.read(4096).await?;
            if chunk.is_empty() {
                break;
            }
            total += chunk.len();
            print!("{}", String::from_utf8_lossy(&chunk));
            // Device nodes like dev/zero never run dry.
            if total >= 64 * 1024 {
                println!("... (truncated)");
                break;
            }
        }
        Ok(())
    }

    async fn write(&self, path: &str, text: &str) -> Result<()> {
        let flags = OpenFlags::CREATE | OpenFlags::TRUNCATE;
        let file = self.root.open(flags, Rights::READ | Rights::WRITE, path)?;
        file.write(text.as_bytes()).await?;
        file.close().await
    }

    async fn append(&self, path: &str, text: &str) -> Result<()> {
        let file = self.root.open(OpenFlags::APPEND, Rights::READ | Rights::WRITE, path)?;
        file.write(text.as_bytes()).await?;
        file.close().await
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        let flags = OpenFlags::CREATE | OpenFlags::FAIL_IF_EXISTS | OpenFlags::DIRECTORY;
        self.root
            .open(flags, Rights::READ | Rights::WRITE, path)?
            .close()
            .await
    }

    async fn rm(&self, path: &str) -> Result<()> {
        let (parent, name) = split_parent(path);
        self.open_dir(&parent)?.unlink(&name).await
    }

    async fn mv(&self, src: &str, dst: &str) -> Result<()> {
        let (src_parent, src_name) = split_parent(src);
        let (dst_parent, dst_name) = split_parent(dst);
        let src_dir = self.open_dir(&src_parent)?;
        let dst_dir = self.open_dir(&dst_parent)?;
        let token = dst_dir.get_token().await?;
        src_dir.rename(&src_name, token, &dst_name).await
    }

    async fn ln(&self, src: &str, dst: &str) -> Result<()> {
        let (src_parent, src_name) = split_parent(src);
        let (dst_parent, dst_name) = split_parent(dst);
        let src_dir = self.open_dir(&src_parent)?;
        let dst_dir = self.open_dir(&dst_parent)?;
        let token = dst_dir.get_token().await?;
        src_dir.link(&src_name, token, &dst_name).await
    }

    async fn stat(&self, path: &str) -> Result<()> {
        let node = self.root.open(OpenFlags::NODE_REFERENCE, Rights::empty(), path)?;
        let attrs = node.get_attrs().await?;
        println!(
            "id {}  size {}  links {}  created {}  modified {}",
            attrs.id, attrs.content_size, attrs.link_count, attrs.creation_time,
            attrs.modification_time,
        );
        Ok(())
    }

    async fn touch(&self, path: &str) -> Result<()> {
        let file = self.root.open(OpenFlags::empty(), Rights::READ | Rights::WRITE, path)?;
        let mut attrs = file.get_attrs().await?;
        attrs.modification_time = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        file.set_attrs(SetAttrMask::MODIFICATION_TIME, attrs).await
    }

    async fn watch(&self, path: &str) -> Result<()> {
        let dir = self.open_dir(path)?;
        let mask = WatchMask::ADDED | WatchMask::REMOVED | WatchMask::EXISTING | WatchMask::IDLE;
        let watcher = dir.watch(mask).await?;
        let label = path.to_owned();
        tokio::spawn(async move {
            // Keep the directory connection alive with the watcher.
            let _dir = dir;
            while let Some(msg) = watcher.recv().await {
                if let Payload::Event(Event::WatchBuffer { events }) = msg.body {
                    if let Ok(events) = decode_watch_events(&events) {
                        for (event, name) in events {
                            println!("[watch {label}] {event:?} {name}");
                        }
                    }
                }
            }
            println!("[watch {label}] closed");
        });
        Ok(())
    }

    /// Creates a mount point directly under the root and grafts a fresh
    /// in-memory filesystem onto it through the remote-mount machinery.
    async fn mount(&mut self, name: &str) -> Result<()> {
        if self.mounts.contains_key(name) {
            return Err(Status::AlreadyExists);
        }

        let remote_root = MemDir::new();
        remote_root.insert("hello", MemFile::new(b"greetings from the mounted filesystem\n"));
        let remote_vfs = Vfs::new();
        let (server_end, client_end) = channel();
        remote_vfs
            .serve_root(remote_root, OpenFlags::empty(), Rights::all(), server_end)
            .await?;

        let mount_point = MemDir::new();
        self.root_dir.insert(name, mount_point.clone());
        let mount_node: Arc<dyn Vnode> = mount_point;
        self.vfs
            .install_remote(mount_node.clone(), RemoteHandle::new(client_end))?;
        if let Some(watchers) = self.root_dir.watchers() {
            watchers.notify(vfserve::watcher::WatchEvent::Added, name);
        }

        self.mounts.insert(name.to_owned(), (mount_node, remote_vfs));
        Ok(())
    }

    async fn umount(&mut self, name: &str) -> Result<()> {
        let (node, _remote_vfs) = self.mounts.remove(name).ok_or(Status::NotFound)?;
        self.vfs.uninstall_remote(&node).await
    }

    async fn dispatch(&mut self, line: &str) -> Result<bool> {
        let mut parts = line.split_whitespace();
        let Some(cmd) = parts.next() else { return Ok(true) };
        let args: Vec<&str> = parts.collect();

        let arg = |i: usize| -> Result<&str> {
            args.get(i).copied().ok_or(Status::InvalidArgs)
        };

        match cmd {
            "ls" => self.ls(args.first().copied().unwrap_or(".")).await?,
            "cat" => self.cat(arg(0)?).await?,
            "write" => self.write(arg(0)?, &args[1..].join(" ")).await?,
            "append" => self.append(arg(0)?, &args[1..].join(" ")).await?,
            "mkdir" => self.mkdir(arg(0)?).await?,
            "rm" => self.rm(arg(0)?).await?,
            "mv" => self.mv(arg(0)?, arg(1)?).await?,
            "ln" => self.ln(arg(0)?, arg(1)?).await?,
            "stat" => self.stat(arg(0)?).await?,
            "touch" => self.touch(arg(0)?).await?,
            "watch" => self.watch(arg(0)?).await?,
            "mount" => self.mount(arg(0)?).await?,
            "umount" => self.umount(arg(0)?).await?,
            "help" => {
                println!(
                    "commands: ls cat write append mkdir rm mv ln stat touch \
                     watch mount umount quit"
                );
            }
            "quit" | "exit" => return Ok(false),
            other => println!("unknown command: {other} (try help)"),
        }
        Ok(true)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let vfs = Vfs::new();
    vfs.set_readonly(cli.readonly);
    let root_dir = demo_root();

    let (server_end, client_end) = channel();
    vfs.serve_root(root_dir.clone(), OpenFlags::empty(), Rights::all(), server_end)
        .await?;

    let mut shell = Shell {
        vfs: vfs.clone(),
        root_dir,
        root: Client::new(client_end),
        mounts: HashMap::new(),
    };

    println!("memofs: in-memory filesystem shell (try help)");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        use std::io::Write as _;
        let _ = std::io::stdout().flush();

        let Ok(Some(line)) = lines.next_line().await else { break };
        match shell.dispatch(line.trim()).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(status) => println!("error: {status}"),
        }
    }

    // Tear every mounted filesystem down before the main one.
    let names: Vec<String> = shell.mounts.keys().cloned().collect();
    for name in names {
        let _ = shell.umount(&name).await;
    }
    vfs.shutdown().await;
    Ok(())
}
