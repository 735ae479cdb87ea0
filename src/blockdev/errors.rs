#![allow(missing_docs, unused_doc_comments)]
error_chain! {
    types {
        Error, ErrorKind, ResultExt, Result;
    }
    foreign_links {
        Io(::std::io::Error);
    }
    errors {
        ReadError(id: String) {
            description("read error")
            display("read error on {}", id)
        }
        WriteError(id: String) {
            description("write error")
            display("write error on {}", id)
        }
        OutOfRange(id: String) {
            description("access beyond end of device")
            display("access beyond end of device {}", id)
        }
        Empty(id: String) {
            description("device has no capacity")
            display("{} is empty", id)
        }
        NoSuchDevice(dev: String) {
            description("no such device")
            display("no device {}", dev)
        }
        InvalidDevId(s: String) {
            description("malformed major:minor")
            display("malformed device number '{}'", s)
        }
    }
}
